//! Per-owner sequential executor over the tokio blocking pool.
//!
//! Jobs run on `spawn_blocking`, one at a time, in submission order. Nothing is
//! coalesced or dropped while the executor is alive.

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Flush(oneshot::Sender<()>),
}

/// Serializes blocking jobs onto a runtime's worker pool.
#[derive(Clone)]
pub struct SequentialExecutor {
    tx: mpsc::UnboundedSender<Command>,
}

impl SequentialExecutor {
    /// Start the executor's dispatch loop on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let blocking = runtime.clone();
        runtime.spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run(job) => {
                        if let Err(e) = blocking.spawn_blocking(job).await {
                            error!("Sequential job failed: {}", e);
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Sequential executor stopped");
        });
        Self { tx }
    }

    /// Queue a job behind every previously queued one.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Command::Run(Box::new(job))).is_err() {
            debug!("Sequential executor gone, dropping job");
        }
    }

    /// Wait until every job queued before this call has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for SequentialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_never_overlap_and_keep_order() {
        let executor = SequentialExecutor::new(&Handle::current());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            executor.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                order.lock().unwrap().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        executor.flush().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_does_not_stop_executor() {
        let executor = SequentialExecutor::new(&Handle::current());
        let ran = Arc::new(AtomicUsize::new(0));

        executor.execute(|| panic!("job failure"));
        let counter = ran.clone();
        executor.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        executor.flush().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
