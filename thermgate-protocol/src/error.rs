//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("short handshake record: expected {expected} bytes, got {actual}")]
    ShortRecord { expected: usize, actual: usize },

    #[error("address too long: {len} bytes (max {max})")]
    AddressTooLong { len: usize, max: usize },

    #[error("address field is not NUL-terminated")]
    UnterminatedAddress,

    #[error("invalid UTF-8 in address field")]
    InvalidUtf8,

    #[error("port out of range: {0}")]
    PortOutOfRange(i32),

    #[error("invalid sensor id: {0}")]
    InvalidSensorId(String),
}
