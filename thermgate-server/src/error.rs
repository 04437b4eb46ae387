//! Server error types.

use thermgate_protocol::SensorId;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] thermgate_protocol::ProtocolError),

    #[error("storage error: {0}")]
    Storage(#[from] thermgate_storage::StorageError),

    #[error("session rejected: {0}")]
    Rejected(#[from] InsertError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns whether the gateway must stop after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Storage(e) => e.is_fatal(),
            ServerError::TlsConfig(_) => true,
            _ => false,
        }
    }
}

/// Reasons a session is refused by the session table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InsertError {
    #[error("connection limit reached for {address}")]
    AdmissionDenied { address: String },

    #[error("port {port} already has a connected session ({existing})")]
    DuplicatePort { port: u16, existing: SensorId },
}

impl InsertError {
    /// Short label used for metrics and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            InsertError::AdmissionDenied { .. } => "admission",
            InsertError::DuplicatePort { .. } => "duplicate_port",
        }
    }
}
