//! Connection-level services of the usvc runtime.
//!
//! [`http::HttpSession`] runs the request loop of one connection,
//! [`http::Relocate`] moves handler work to another thread and [`serve`]
//! ties them to a listener, a runtime and process signals. [`serve_threaded`]
//! does the same on several I/O threads sharing one port.
pub mod common;
pub mod http;
mod serve;

pub use serve::{
    serve, serve_threaded, serve_threaded_until, serve_with_shutdown, ServeError, ServeOptions,
    StopSignal,
};
