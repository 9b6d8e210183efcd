//! Error types for the collector
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::transport::{CmEventKind, WcStatus};

/// Result type alias using CollectorError
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Unified error type for collector operations
#[derive(Debug, Error)]
pub enum CollectorError {
    // -------------------------------------------------------------------------
    // I/O and Memory Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory mapping failed: {0}")]
    Mman(#[from] nix::Error),

    #[error("Allocation error: {0}")]
    Allocation(String),

    // -------------------------------------------------------------------------
    // Transport Setup Errors
    // -------------------------------------------------------------------------
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Port {0} is already bound")]
    AddressInUse(u16),

    #[error("Unexpected connection manager event: expected {expected:?}, got {got:?}")]
    UnexpectedEvent {
        expected: CmEventKind,
        got: CmEventKind,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    // -------------------------------------------------------------------------
    // Completion Errors
    // -------------------------------------------------------------------------
    #[error("Work request {wr_id} completed with status {status:?}")]
    Completion { status: WcStatus, wr_id: u64 },

    // -------------------------------------------------------------------------
    // Peer Errors
    // -------------------------------------------------------------------------
    #[error("Remote access error: {0}")]
    RemoteAccess(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    #[error("Store '{0}' is not ready")]
    NotReady(String),

    #[error("Slot index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: u64, capacity: u64 },

    #[error("Worker thread failed: {0}")]
    Worker(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
