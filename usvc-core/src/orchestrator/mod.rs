//! Connection acceptance and the executors sessions and handlers run on.
//!
//! [`serve`] is the accept supervisor: it pulls connections off a listener
//! and runs one detached session task per connection on the current monoio
//! runtime. [`RuntimeWrapper`] builds that runtime, [`spawn_pinned`] starts
//! the threads runtimes live on, and [`WorkerPool`] offers extra threads for
//! handler work.
use std::{fmt::Debug, io, rc::Rc};

use futures_channel::mpsc::UnboundedSender;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, info, warn};

use crate::listener::SessionStream;

mod runtime;
mod thread;
mod worker_pool;

pub use runtime::RuntimeWrapper;
pub use thread::spawn_pinned;
pub use worker_pool::{Job, WorkerPool};

/// Sending end of the channel sessions report handler errors into.
pub type FaultSink<E> = UnboundedSender<E>;

/// Accept connections and serve each one with `svc` on its own task.
///
/// Session tasks are detached and never awaited. A session that fails sends
/// its error into `faults` and the loop carries on. Accept errors are logged
/// and skipped unless the listener itself is no longer usable, which ends
/// the loop with that error. A listener that runs dry ends it with `Ok`.
pub async fn serve<L, S, A, Svc>(
    mut listener: L,
    svc: Rc<Svc>,
    faults: FaultSink<Svc::Error>,
) -> io::Result<()>
where
    L: Stream<Item = io::Result<(S, A)>>,
    S: SessionStream + 'static,
    A: Debug,
    Svc: Service<S> + 'static,
    Svc::Error: 'static,
{
    loop {
        let accept = match listener.next().await {
            Some(accept) => accept,
            None => {
                info!("listener is closed, serve stopped");
                return Ok(());
            }
        };
        let (stream, peer) = match accept {
            Ok(accepted) => accepted,
            Err(e) if is_listener_gone(&e) => return Err(e),
            Err(e) => {
                warn!("Accept connection failed: {e:?}");
                continue;
            }
        };

        let handle = stream.connection_handle();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set nodelay on connection {handle} failed: {e}");
        }
        debug!("accepted connection {handle} from {peer:?}");

        let svc = svc.clone();
        let faults = faults.clone();
        monoio::spawn(async move {
            match svc.call(stream).await {
                Ok(_) => debug!("Connection {handle} complete"),
                Err(e) => {
                    // the runner may be gone already during shutdown
                    let _ = faults.unbounded_send(e);
                }
            }
        });
    }
}

/// Errors after which accepting again cannot succeed.
fn is_listener_gone(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::InvalidInput {
        return true;
    }
    #[cfg(unix)]
    if matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK)
    ) {
        return true;
    }
    false
}
