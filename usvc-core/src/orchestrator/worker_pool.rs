use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
    thread::JoinHandle,
};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{future::LocalBoxFuture, StreamExt};
use tracing::{debug, error};

use super::{spawn_pinned, RuntimeWrapper};
use crate::config::RuntimeConfig;

/// Work shipped to a pool thread. The closure is sent across threads, the
/// future it builds stays on the worker runtime.
pub type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

/// A fixed set of OS threads, each driving its own monoio runtime.
///
/// Jobs are handed out round-robin and run as independent tasks, so one
/// worker interleaves many jobs. Dropping the pool closes every queue; the
/// workers exit once their queue is drained. Tasks still running at that
/// point are dropped with the runtime.
pub struct WorkerPool {
    workers: Vec<UnboundedSender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize, runtime_config: &RuntimeConfig) -> io::Result<Self> {
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            let runtime_config = runtime_config.clone();
            let handle = spawn_pinned(
                format!("usvc-handler-{worker_id}"),
                worker_id,
                runtime_config.cpu_affinity,
                move || run_worker(worker_id, &runtime_config, rx),
            )?;
            workers.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            workers,
            handles,
            next: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job on the next worker. The job is handed back when that
    /// worker is gone.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx]
            .unbounded_send(job)
            .map_err(|e| e.into_inner())
    }

    /// Close the queues and wait for every worker thread to exit.
    pub fn join(self) {
        let Self {
            workers, handles, ..
        } = self;
        drop(workers);
        for handle in handles {
            if handle.join().is_err() {
                error!("handler worker thread panicked");
            }
        }
    }
}

fn run_worker(worker_id: usize, runtime_config: &RuntimeConfig, mut rx: UnboundedReceiver<Job>) {
    let mut runtime = match RuntimeWrapper::new(runtime_config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("build runtime for handler worker {worker_id} failed: {e}");
            return;
        }
    };
    runtime.block_on(async move {
        while let Some(job) = rx.next().await {
            monoio::spawn(job());
        }
    });
    debug!("handler worker {worker_id} exited");
}
