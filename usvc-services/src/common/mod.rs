mod panic;

pub(crate) use panic::panic_message;
pub use panic::{CatchPanicError, CatchPanicService};
