//! # thermgate-protocol
//!
//! Wire types shared by the thermgate gateway and its sensor links.
//!
//! This crate provides:
//! - The `Reading` value exchanged between sessions and storage
//! - The fixed-size handshake record a link sends after connecting
//! - Protocol error types

pub mod error;
pub mod handshake;
pub mod reading;

pub use error::ProtocolError;
pub use handshake::{HandshakeRecord, HANDSHAKE_RECORD_SIZE, MAX_ADDRESS_LEN};
pub use reading::{Reading, SensorId};

/// Default listening port for the gateway.
pub const DEFAULT_PORT: u16 = 8080;
