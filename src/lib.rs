//! # DTA Collector
//!
//! Server side of a one-sided, remotely writable slot store:
//! - Pinned, huge-page backed storage registered with the fabric
//! - Connection/registration handshake that advertises the region
//! - Key/value, postcard and append-log layouts addressable by peers
//! - Local lookup and diagnostics for verification and benchmarking
//!
//! ## Architecture Overview
//!
//! ```text
//!  remote peer (translator)          collector process
//! ┌──────────────────────┐        ┌──────────────────────────────────────┐
//! │ connect ─────────────┼───────►│ TransportSession (listen/accept)     │
//! │ recv metadata ◄──────┼────────┤   register region, advertise, PSN    │
//! │                      │        ├──────────────────────────────────────┤
//! │ one-sided writes ────┼───────►│ StorageArea (pinned slots)           │
//! │ at index * slot_size │        │   HashKeyValueStore   (CRC probes)   │
//! └──────────────────────┘        │   MultiHopRecordStore (postcards)    │
//!                                 │   CircularAppendLog   (cursor)       │
//!                                 ├──────────────────────────────────────┤
//!                                 │ Diagnostics (analyze, gaps, CQ)      │
//!                                 └──────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod diagnostics;
pub mod memory;
pub mod store;
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{PagePolicy, SessionConfig, StoreConfig};
pub use error::{CollectorError, Result};
pub use store::{AddressableSlotStore, CircularAppendLog, HashKeyValueStore, MultiHopRecordStore};
pub use transport::{Fabric, LoopbackFabric, RemotePeer, TransportSession};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of the collector
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
