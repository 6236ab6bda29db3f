mod error;
pub use error::AnyError;

pub mod config;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod orchestrator;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
