//! # thermgate-storage
//!
//! Storage layer for thermgate.
//!
//! This crate provides:
//! - An in-memory queue of readings awaiting persistence
//! - SQLite connection management with bounded retry
//! - Transactional drain of pending readings

pub mod error;
pub mod queue;

pub use error::StorageError;
pub use queue::{CycleOutcome, DbStatus, DrainReport, QueueConfig, StorageQueue};
