//! Shared gateway state.

use crate::admission::AdmissionLedger;
use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::table::SessionTable;
use crate::tls::{create_tls_acceptor, create_tls_connector};
use std::sync::Arc;
use thermgate_storage::StorageQueue;
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Process-wide stop flag. Cloned into every long-running task.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raises the flag. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the gateway's tasks share, built once at startup.
pub struct GatewayContext {
    pub config: Config,
    pub admission: Arc<AdmissionLedger>,
    pub table: Arc<SessionTable>,
    pub storage: Arc<StorageQueue>,
    pub stop: StopSignal,
    pub metrics: Option<Arc<Metrics>>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_connector: Option<TlsConnector>,
}

impl GatewayContext {
    /// Builds the shared state. TLS credentials are loaded here, so a bad
    /// certificate stops startup.
    pub fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let admission = Arc::new(AdmissionLedger::new(
            config.admission.max_per_address,
            config.admission.max_addresses,
        ));
        let table = Arc::new(SessionTable::new(
            admission.clone(),
            config.session.id_policy,
        ));
        let storage = Arc::new(StorageQueue::new(config.storage.queue_config()));

        let tls_acceptor = if config.tls.enabled {
            Some(create_tls_acceptor(&config.tls)?)
        } else {
            None
        };
        let tls_connector = if config.client_tls.enabled {
            Some(create_tls_connector(&config.client_tls)?)
        } else {
            None
        };
        let metrics = if config.metrics.enabled {
            Some(Arc::new(Metrics::new()?))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            admission,
            table,
            storage,
            stop: StopSignal::new(),
            metrics,
            tls_acceptor,
            tls_connector,
        }))
    }

    /// Runs `f` against the metrics registry when metrics are enabled.
    pub fn with_metrics(&self, f: impl FnOnce(&Metrics)) {
        if let Some(ref metrics) = self.metrics {
            f(metrics);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());

        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stop.is_stopped());

        // Late waiters return immediately.
        tokio::time::timeout(Duration::from_millis(100), stop.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_context_rejects_missing_credentials() {
        let mut config = Config::default();
        config.tls.cert_path = Some("/nonexistent/cert.pem".into());
        let err = GatewayContext::new(config).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tls_context_loads_credentials() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = test_support::tls_context(dir.path(), |_| {});
        assert!(ctx.tls_acceptor.is_some());
        assert!(ctx.tls_connector.is_some());
    }

    #[test]
    fn test_plain_context() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = test_support::plain_context(dir.path(), |c| c.metrics.enabled = true);
        assert!(ctx.tls_acceptor.is_none());
        assert!(ctx.tls_connector.is_none());
        assert!(ctx.metrics.is_some());
        assert_eq!(ctx.table.active_count(), 0);
    }
}
