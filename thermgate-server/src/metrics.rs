//! Prometheus metrics for the gateway.
//!
//! This module provides:
//! - A registry with session, rejection and storage counters
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::context::StopSignal;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Gateway metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Sessions admitted into the table.
    pub sessions_total: Counter,
    /// Sessions currently in the table.
    pub sessions_active: Gauge,
    /// Links refused, by reason.
    pub rejections_total: CounterVec,
    /// Sessions evicted for inactivity.
    pub sessions_reaped_total: Counter,
    /// Readings appended to the storage queue.
    pub readings_enqueued_total: Counter,
    /// Readings written to the database.
    pub readings_persisted_total: Counter,
    /// Insert attempts that failed and were left queued.
    pub persist_failures_total: Counter,
    /// Readings waiting in the storage queue.
    pub readings_pending: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sessions_total = Counter::with_opts(Opts::new(
            "thermgate_sessions_total",
            "Total number of sensor sessions admitted",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "thermgate_sessions_active",
            "Number of sensor sessions in the table",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let rejections_total = CounterVec::new(
            Opts::new("thermgate_rejections_total", "Links refused by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let sessions_reaped_total = Counter::with_opts(Opts::new(
            "thermgate_sessions_reaped_total",
            "Sessions evicted for inactivity",
        ))?;
        registry.register(Box::new(sessions_reaped_total.clone()))?;

        let readings_enqueued_total = Counter::with_opts(Opts::new(
            "thermgate_readings_enqueued_total",
            "Readings appended to the storage queue",
        ))?;
        registry.register(Box::new(readings_enqueued_total.clone()))?;

        let readings_persisted_total = Counter::with_opts(Opts::new(
            "thermgate_readings_persisted_total",
            "Readings written to the database",
        ))?;
        registry.register(Box::new(readings_persisted_total.clone()))?;

        let persist_failures_total = Counter::with_opts(Opts::new(
            "thermgate_persist_failures_total",
            "Reading inserts that failed and stayed queued",
        ))?;
        registry.register(Box::new(persist_failures_total.clone()))?;

        let readings_pending = Gauge::with_opts(Opts::new(
            "thermgate_readings_pending",
            "Readings waiting in the storage queue",
        ))?;
        registry.register(Box::new(readings_pending.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            sessions_active,
            rejections_total,
            sessions_reaped_total,
            readings_enqueued_total,
            readings_persisted_total,
            persist_failures_total,
            readings_pending,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

/// Runs the HTTP metrics server until `stop` is raised.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    stop: StopSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = stop.wait() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(metrics.encode()),
        ),
        "/health" | "/healthz" => (StatusCode::OK, "text/plain", Bytes::from_static(b"OK")),
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.sessions_total.inc();
        metrics.sessions_active.set(3.0);
        metrics
            .rejections_total
            .with_label_values(&["duplicate_port"])
            .inc();
        metrics.readings_persisted_total.inc_by(4.0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("thermgate_sessions_total 1"));
        assert!(encoded.contains("thermgate_sessions_active 3"));
        assert!(encoded.contains("reason=\"duplicate_port\""));
        assert!(encoded.contains("thermgate_readings_persisted_total 4"));
    }

    #[tokio::test]
    async fn test_metrics_server_stops() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let stop = StopSignal::new();
        let server = tokio::spawn(run_metrics_server(
            "127.0.0.1:0".parse().unwrap(),
            metrics,
            stop.clone(),
        ));
        stop.stop();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
