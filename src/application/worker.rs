use crate::application::coordinator::TransferCoordinator;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Calls to `process_next` that found and finished a transfer.
    pub processed: usize,
    /// Calls to `process_next` that returned an error.
    pub failed: usize,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.failed += rhs.failed;
    }
}

/// A fixed set of tokio tasks that keep calling
/// [`TransferCoordinator::process_next`] until told to stop.
///
/// Workers never coordinate with each other; they rely on the stores'
/// conditional updates, exactly like independent processes would.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Starts `config.worker.workers` workers on the current runtime.
    pub fn spawn(coordinator: Arc<TransferCoordinator>) -> Self {
        let worker_config = coordinator.config().worker.clone();
        let idle_poll = worker_config.idle_poll();
        let (shutdown, signal) = watch::channel(false);

        let handles = (0..worker_config.workers.max(1))
            .map(|worker| {
                let coordinator = coordinator.clone();
                let signal = signal.clone();
                tokio::spawn(run_worker(worker, coordinator, signal, idle_poll))
            })
            .collect();

        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every worker to stop after its current transfer and waits for them.
    pub async fn shutdown(self) -> WorkerStats {
        // Workers that already exited have dropped their receivers.
        let _ = self.shutdown.send(true);

        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total += stats,
                Err(err) => error!(error = %err, "worker task failed to join"),
            }
        }
        total
    }
}

async fn run_worker(
    worker: usize,
    coordinator: Arc<TransferCoordinator>,
    mut signal: watch::Receiver<bool>,
    idle_poll: Duration,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    debug!(worker, "worker started");

    loop {
        let stopping = *signal.borrow();
        if stopping {
            break;
        }
        match coordinator.process_next().await {
            Ok(true) => {
                stats.processed += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                stats.failed += 1;
                warn!(worker, error = %err, "transfer processing failed");
            }
        }

        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle_poll) => {}
        }
    }

    debug!(
        worker,
        processed = stats.processed,
        failed = stats.failed,
        "worker stopped"
    );
    stats
}
