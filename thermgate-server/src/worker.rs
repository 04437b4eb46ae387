//! Background storage drain.

use crate::context::{GatewayContext, StopSignal};
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use thermgate_storage::{CycleOutcome, StorageError, StorageQueue};

/// Drives the storage queue's connect/drain cycle on the blocking pool.
pub struct StorageWorker {
    storage: Arc<StorageQueue>,
    stop: StopSignal,
    metrics: Option<Arc<Metrics>>,
}

impl StorageWorker {
    pub fn new(ctx: &GatewayContext) -> Self {
        Self {
            storage: ctx.storage.clone(),
            stop: ctx.stop.clone(),
            metrics: ctx.metrics.clone(),
        }
    }

    /// Runs cycles until stopped. Returns an error only when the database
    /// stays unreachable past the retry limit; the gateway cannot continue
    /// after that.
    pub async fn run(&self) -> Result<(), StorageError> {
        let config = self.storage.config().clone();
        tracing::info!(
            "Storage worker started (db={}, drain_interval={:?})",
            config.db_path.display(),
            config.drain_interval
        );

        while !self.stop.is_stopped() {
            let storage = self.storage.clone();
            let outcome = match tokio::task::spawn_blocking(move || storage.cycle()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Storage cycle task failed: {}", e);
                    Err(StorageError::NotConnected)
                }
            };

            let delay = match outcome {
                Ok(CycleOutcome::Drained(report)) => {
                    if report.persisted > 0 || report.failed > 0 {
                        tracing::debug!(
                            "Drained {} readings ({} failed, {} pending)",
                            report.persisted,
                            report.failed,
                            self.storage.pending_len()
                        );
                    }
                    self.record(|m| {
                        m.readings_persisted_total.inc_by(report.persisted as f64);
                        m.persist_failures_total.inc_by(report.failed as f64);
                    });
                    config.drain_interval
                }
                Ok(CycleOutcome::Backoff { attempt }) => {
                    tracing::info!(
                        "Retrying database connection in {:?} (attempt {}/{})",
                        config.retry_delay,
                        attempt,
                        config.retry_limit
                    );
                    config.retry_delay
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Storage worker giving up: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Storage cycle failed: {}", e);
                    config.retry_delay
                }
            };
            self.record(|m| m.readings_pending.set(self.storage.pending_len() as f64));

            self.pause(delay).await;
        }

        self.flush().await;
        tracing::info!("Storage worker stopped");
        Ok(())
    }

    /// Persists what is left on shutdown and closes the connection.
    async fn flush(&self) {
        let storage = self.storage.clone();
        let result = tokio::task::spawn_blocking(move || {
            let report = match storage.status() {
                thermgate_storage::DbStatus::Connected => storage.drain().ok(),
                thermgate_storage::DbStatus::Disconnected => None,
            };
            storage.close();
            report
        })
        .await;

        match result {
            Ok(Some(report)) if report.persisted > 0 => {
                tracing::info!("Flushed {} readings on shutdown", report.persisted);
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Storage flush task failed: {}", e),
        }
        let pending = self.storage.pending_len();
        if pending > 0 {
            tracing::warn!("{} readings were not persisted", pending);
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.wait() => {}
        }
    }

    fn record(&self, f: impl FnOnce(&Metrics)) {
        if let Some(ref metrics) = self.metrics {
            f(metrics);
        }
    }
}
