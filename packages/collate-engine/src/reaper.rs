//! Background reaper: periodic expiry sweeps over the group store.
//!
//! The reaper owns a spawned task that runs a sweep on every tick and on
//! demand via [`Reaper::run_now`]. A sweep asks the store for groups older
//! than the scan threshold; the store drives the engine's forced-completion
//! callback for each candidate, which re-checks everything under the per-key
//! lock. Sweep errors are logged and retried on the next tick -- they never
//! propagate out of the timer task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::engine::CorrelationEngine;

/// Commands accepted by the reaper task.
#[derive(Debug)]
enum ReapCommand {
    Sweep,
}

/// Handle to the background reaper task.
pub struct Reaper {
    tx: Option<mpsc::Sender<ReapCommand>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Reaper {
    /// Spawns the reaper for the given engine, ticking at the engine's
    /// configured interval.
    #[must_use]
    pub fn start(engine: Arc<CorrelationEngine>) -> Self {
        let interval = Duration::from_millis(engine.config().reap_interval_ms);
        let threshold = engine.config().reap_scan_threshold();
        let (tx, mut rx) = mpsc::channel::<ReapCommand>(16);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // Skip the immediate first tick so a sweep doesn't fire at startup.
            tick.tick().await;

            loop {
                tokio::select! {
                    command = rx.recv() => {
                        match command {
                            Some(ReapCommand::Sweep) => sweep(&engine, threshold).await,
                            None => break, // Channel closed.
                        }
                    }
                    _ = tick.tick() => {
                        sweep(&engine, threshold).await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Requests an immediate sweep without waiting for the next tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the reaper has been stopped.
    pub async fn run_now(&self) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(ReapCommand::Sweep)
                .await
                .map_err(|_| anyhow::anyhow!("reaper task is not running")),
            None => Err(anyhow::anyhow!("reaper has been stopped")),
        }
    }

    /// Stops the reaper gracefully, waiting for the task to finish.
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

async fn sweep(engine: &Arc<CorrelationEngine>, threshold: Duration) {
    match engine.store().expire_message_groups(threshold).await {
        Ok(0) => {}
        Ok(count) => tracing::debug!(count, "reaper sweep processed groups"),
        Err(error) => {
            tracing::warn!(%error, "reaper sweep failed; retrying on the next tick");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
