pub type AnyError = anyhow::Error;
