//! HTTP/1.1 connection handling: the session loop and handler relocation.
mod relocate;
mod session;

pub use relocate::{relocate, Relocate, RelocateError};
pub use session::{finalize_response, run_session, HttpSession};
