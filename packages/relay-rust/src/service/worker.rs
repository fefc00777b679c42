//! Background maintenance of the operation store.
//!
//! The relay runs a [`RetentionSweeper`] on a [`BackgroundWorker`]: the
//! worker ticks on the sweep interval and also accepts [`SweepTask`]s, so
//! `MessageRelay::sweep_now` can force an eviction between ticks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::store::OperationStore;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker fed through an mpsc channel.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the worker. `tick_interval_ms` is clamped to at least 1ms.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stop the worker, waiting for its task to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// RetentionSweeper
// ---------------------------------------------------------------------------

/// On-demand sweep request for the retention worker.
#[derive(Debug)]
pub enum SweepTask {
    /// Evict now, using the configured retention, and report the count.
    RunNow { evicted: oneshot::Sender<usize> },
}

/// Evicts terminal operations older than the retention window on every tick.
pub struct RetentionSweeper {
    store: Arc<OperationStore>,
    retention_ms: u64,
}

impl RetentionSweeper {
    #[must_use]
    pub fn new(store: Arc<OperationStore>, retention_ms: u64) -> Self {
        Self {
            store,
            retention_ms,
        }
    }

    /// Evict once and return how many operations were dropped.
    pub fn sweep(&self) -> usize {
        let evicted = self.store.evict_terminal_older_than(self.retention_ms);
        if evicted > 0 {
            metrics::counter!("opsbridge_operations_evicted_total")
                .increment(u64::try_from(evicted).unwrap_or(u64::MAX));
        }
        debug!(evicted, remaining = self.store.len(), "retention sweep");
        evicted
    }
}

#[async_trait]
impl BackgroundRunnable for RetentionSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow { evicted } => {
                // The requester may have given up waiting.
                let _ = evicted.send(self.sweep());
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
