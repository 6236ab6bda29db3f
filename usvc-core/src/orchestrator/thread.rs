use std::{io, thread::JoinHandle};

#[cfg(target_os = "linux")]
use monoio::utils::bind_to_cpu_set;
use tracing::warn;

/// Start a named OS thread running `f`.
///
/// With `cpu_affinity` set the thread is bound to core
/// `thread_id % available cores` first. Pinning failures are logged and
/// the thread runs unpinned.
pub fn spawn_pinned<F, T>(
    name: String,
    thread_id: usize,
    cpu_affinity: bool,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let cores = if cpu_affinity {
        std::thread::available_parallelism().ok()
    } else {
        None
    };
    std::thread::Builder::new().name(name).spawn(move || {
        // bind thread to cpu core
        #[cfg(target_os = "linux")]
        if let Some(cores) = cores {
            let core = thread_id % cores;
            if let Err(e) = bind_to_cpu_set([core]) {
                warn!("bind thread {thread_id} to core {core} failed: {e}");
            }
        }
        #[cfg(not(target_os = "linux"))]
        if cores.is_some() {
            warn!("cpu affinity is not supported here, thread {thread_id} runs unpinned");
        }
        f()
    })
}
