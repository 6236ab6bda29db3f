use std::{
    fmt::Debug,
    future::Future,
    io,
    pin::pin,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::StreamExt;
use futures_channel::{mpsc, oneshot};
use thiserror::Error;
use tracing::{error, info};
use usvc_core::{
    config::{FaultPolicy, ServerConfig},
    http::{HttpHandler, DEFAULT_MAX_REQUEST_SIZE},
    listener::{Listener, SessionStream},
    metrics::Reporter,
    orchestrator::{self, spawn_pinned, RuntimeWrapper},
};

use crate::{common::CatchPanicService, http::HttpSession};

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("build runtime failed: {0}")]
    Runtime(#[source] io::Error),
    #[error("bind port {port} failed: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
    #[error("install signal handler failed: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("session fault: {0}")]
    HandlerFault(String),
    #[error("start io thread failed: {0}")]
    Spawn(#[source] io::Error),
    #[error("io thread {0} panicked")]
    IoThreadPanic(usize),
}

/// Per-server knobs for [`serve_with_shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOptions {
    pub max_request_size: usize,
    pub fault_policy: FaultPolicy,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl From<&ServerConfig> for ServeOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_request_size: config.max_request_size,
            fault_policy: config.fault_policy,
        }
    }
}

/// Stop trigger shared by every I/O thread of a server.
///
/// Firing is sticky: waiters registered afterwards resolve at once.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<Mutex<StopState>>);

#[derive(Default)]
struct StopState {
    fired: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl StopSignal {
    pub fn fire(&self) {
        let mut state = self.lock();
        state.fired = true;
        for tx in state.waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    pub fn is_fired(&self) -> bool {
        self.lock().fired
    }

    /// A future resolving once the signal fires.
    pub fn wait(&self) -> impl Future<Output = ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.fired {
                let _ = tx.send(());
            } else {
                state.waiters.push(tx);
            }
        }
        async move {
            let _ = rx.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, StopState> {
        // the state stays consistent even if a holder panicked
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fires the signal when dropped, so a thread that exits for any reason,
/// a panic included, stops its siblings.
struct FireOnDrop(StopSignal);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// A [`StopSignal`] fired by SIGINT or SIGTERM. The handler is process wide,
/// so this can be installed once per process.
fn termination_signal() -> Result<StopSignal, ServeError> {
    let stop = StopSignal::default();
    let on_signal = stop.clone();
    ctrlc::set_handler(move || {
        info!("termination signal received");
        on_signal.fire();
    })?;
    Ok(stop)
}

/// Serve `handler` on `0.0.0.0:{config.port}` until SIGINT or SIGTERM.
///
/// Blocks the calling thread on a fresh runtime, which is the only I/O
/// thread. Use [`serve_threaded`] to honor `config.io_threads`.
pub fn serve<H, R>(config: &ServerConfig, handler: H, reporter: R) -> Result<(), ServeError>
where
    H: HttpHandler + 'static,
    H::Error: Debug + 'static,
    R: Reporter + 'static,
{
    let stop = termination_signal()?;
    let mut runtime = RuntimeWrapper::new(&config.runtime).map_err(ServeError::Runtime)?;
    info!(
        "runtime started with the {} driver",
        if runtime.is_io_uring() { "io_uring" } else { "legacy" }
    );

    let port = config.port;
    let options = ServeOptions::from(config);
    runtime.block_on(async move {
        let listener = Listener::bind(port).map_err(|source| ServeError::Bind { port, source })?;
        info!("listening on 0.0.0.0:{port}");
        serve_with_shutdown(listener, handler, reporter, options, stop.wait()).await
    })
}

/// Serve on `config.io_threads` threads until SIGINT or SIGTERM.
///
/// `make` is called once on each I/O thread with the thread index and builds
/// that thread's handler and reporter, so neither has to be `Send`.
pub fn serve_threaded<M, H, R>(config: &ServerConfig, make: M) -> Result<(), ServeError>
where
    M: Fn(usize) -> (H, R) + Send + Sync + 'static,
    H: HttpHandler + 'static,
    H::Error: Debug + 'static,
    R: Reporter + 'static,
{
    let stop = termination_signal()?;
    serve_threaded_until(config, make, stop)
}

/// Serve on `config.io_threads` threads until `stop` fires.
///
/// Every thread runs its own runtime and accept loop on a listener bound
/// with `SO_REUSEPORT`, and sessions stay on the thread that accepted them.
/// When one thread stops, for any reason, the others are stopped too. The
/// first error reported, in thread order, is returned.
pub fn serve_threaded_until<M, H, R>(
    config: &ServerConfig,
    make: M,
    stop: StopSignal,
) -> Result<(), ServeError>
where
    M: Fn(usize) -> (H, R) + Send + Sync + 'static,
    H: HttpHandler + 'static,
    H::Error: Debug + 'static,
    R: Reporter + 'static,
{
    let threads = config.io_threads.max(1);
    let make = Arc::new(make);
    let mut handles = Vec::with_capacity(threads);
    for thread_id in 0..threads {
        let make = make.clone();
        let thread_stop = stop.clone();
        let thread_config = config.clone();
        let spawned = spawn_pinned(
            format!("usvc-io-{thread_id}"),
            thread_id,
            config.runtime.cpu_affinity,
            move || {
                let _guard = FireOnDrop(thread_stop.clone());
                run_io_thread(thread_id, &thread_config, make.as_ref(), thread_stop)
            },
        );
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!("start io thread {thread_id} failed: {e}");
                stop.fire();
                let _ = join_io_threads(handles);
                return Err(ServeError::Spawn(e));
            }
        }
    }
    info!("{threads} io threads started on port {}", config.port);
    join_io_threads(handles)
}

fn run_io_thread<M, H, R>(
    thread_id: usize,
    config: &ServerConfig,
    make: &M,
    stop: StopSignal,
) -> Result<(), ServeError>
where
    M: Fn(usize) -> (H, R),
    H: HttpHandler + 'static,
    H::Error: Debug + 'static,
    R: Reporter + 'static,
{
    let mut runtime = RuntimeWrapper::new(&config.runtime).map_err(ServeError::Runtime)?;
    let port = config.port;
    let options = ServeOptions::from(config);
    let (handler, reporter) = make(thread_id);
    runtime.block_on(async move {
        let listener = Listener::bind_reuse_port(port)
            .map_err(|source| ServeError::Bind { port, source })?;
        serve_with_shutdown(listener, handler, reporter, options, stop.wait()).await
    })
}

fn join_io_threads(
    handles: Vec<std::thread::JoinHandle<Result<(), ServeError>>>,
) -> Result<(), ServeError> {
    let mut result = Ok(());
    for (thread_id, handle) in handles.into_iter().enumerate() {
        let res = match handle.join() {
            Ok(res) => res,
            Err(_) => Err(ServeError::IoThreadPanic(thread_id)),
        };
        if let Err(e) = res {
            error!("io thread {thread_id} failed: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// Serve connections from `listener` until `shutdown` resolves.
///
/// Session faults are handled per [`FaultPolicy`]. On shutdown the listener
/// is dropped and sessions still running are left to the runtime.
pub async fn serve_with_shutdown<L, S, A, H, R, F>(
    listener: L,
    handler: H,
    reporter: R,
    options: ServeOptions,
    shutdown: F,
) -> Result<(), ServeError>
where
    L: monoio::io::stream::Stream<Item = io::Result<(S, A)>>,
    S: SessionStream + 'static,
    A: Debug,
    H: HttpHandler + 'static,
    H::Error: Debug + 'static,
    R: Reporter + 'static,
    F: Future<Output = ()>,
{
    let session =
        HttpSession::new(handler, reporter).with_max_request_size(options.max_request_size);
    let svc = Rc::new(CatchPanicService::new(session));
    let (fault_tx, mut fault_rx) = mpsc::unbounded();

    let mut accept = pin!(orchestrator::serve(listener, svc, fault_tx));
    let mut shutdown = pin!(shutdown);
    loop {
        monoio::select! {
            res = &mut accept => {
                return match res {
                    Ok(()) => {
                        info!("accept loop finished");
                        Ok(())
                    }
                    Err(e) => {
                        error!("listener failed: {e}");
                        Err(ServeError::Listener(e))
                    }
                };
            }
            _ = &mut shutdown => {
                info!("stop accepting connections");
                return Ok(());
            }
            fault = fault_rx.next() => {
                let Some(fault) = fault else { continue };
                match options.fault_policy {
                    FaultPolicy::Log => error!("session fault: {fault}"),
                    FaultPolicy::Shutdown => {
                        error!("session fault, shutting down: {fault}");
                        return Err(ServeError::HandlerFault(fault.to_string()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test]
    async fn test_stop_signal_wakes_waiters() {
        let stop = StopSignal::default();
        let early = stop.wait();
        assert!(!stop.is_fired());

        stop.clone().fire();
        early.await;
        // waiters registered after firing resolve at once
        stop.wait().await;
        assert!(stop.is_fired());
    }

    #[test]
    fn test_exiting_thread_stops_siblings() {
        let stop = StopSignal::default();
        let guard = FireOnDrop(stop.clone());
        let thread = std::thread::spawn(move || {
            let _guard = guard;
            panic!("io thread down");
        });
        assert!(thread.join().is_err());
        assert!(stop.is_fired());
    }
}
