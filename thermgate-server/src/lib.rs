//! # thermgate-server
//!
//! Gateway server for thermgate.
//!
//! This crate provides:
//! - Per-address admission control
//! - Plain or TLS transports behind one stream type
//! - The session table and the gateway accept loop
//! - Idle-session reaping and the storage drain task
//! - Synthetic sampling and temperature threshold monitoring
//! - Operator command parsing and outbound sensor links
//! - Optional Prometheus metrics

pub mod admission;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod monitor;
pub mod outbound;
pub mod reaper;
pub mod sampler;
pub mod session;
pub mod table;
pub mod tls;
pub mod transport;
pub mod worker;

pub use admission::AdmissionLedger;
pub use commands::{Command, CommandError};
pub use config::{
    AdmissionConfig, ClientTlsConfig, Config, ConfigError, LoggingConfig, MetricsConfig,
    MonitorConfig, NetworkConfig, SamplerConfig, SessionConfig, StorageConfig, TlsConfig,
};
pub use context::{GatewayContext, StopSignal};
pub use error::{InsertError, ServerError};
pub use gateway::Gateway;
pub use metrics::Metrics;
pub use monitor::ThresholdMonitor;
pub use reaper::Reaper;
pub use sampler::Sampler;
pub use session::{LinkStatus, Session, SessionInfo, SensorIdPolicy};
pub use table::SessionTable;
pub use transport::SecureTransport;
pub use worker::StorageWorker;
