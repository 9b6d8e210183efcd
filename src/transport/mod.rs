//! Transport Module
//!
//! The capability the stores consume from the kernel-bypass fabric, and the
//! session state machine that drives it.
//!
//! ## Responsibilities
//! - Connection manager: bind, listen, wait for events, accept
//! - Verbs: register memory, post sends, poll completions, query PSN
//! - Session lifecycle with RAII teardown
//!
//! ## Session States
//! ```text
//! Unbound ─► Listening ─► ConnectRequestReceived ─► Accepted
//!                                                      │
//!   Ready ◄─ MetadataAdvertised ◄─ RegionRegistered ◄──┘
//! ```
//!
//! Any fabric implementing [`Fabric`] can back a session. [`LoopbackFabric`]
//! is the in-process implementation used by tests, benches and the demo
//! collector.

mod loopback;
mod metadata;
mod session;

pub use loopback::{LoopbackFabric, RemotePeer};
pub use metadata::{RegionMetadata, METADATA_LEN};
pub use session::{RdmaInfo, SessionState, TransportSession};

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueuePairConfig;
use crate::error::Result;

/// Packet sequence numbers are 24 bits wide
pub const PSN_MASK: u32 = 0x00FF_FFFF;

/// Connection manager identifier of a pending or accepted connection
pub type ConnectionId = u64;

// =============================================================================
// Connection Manager Events
// =============================================================================

/// Connection manager event types the session cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    ConnectRequest,
    Established,
    Rejected,
    Unreachable,
    Disconnected,
    Other(u32),
}

/// One event read from a connection manager channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    pub id: ConnectionId,
    /// Non-zero when the transport reports a failure for this event
    pub status: i32,
}

// =============================================================================
// Verbs Types
// =============================================================================

/// Access rights granted when registering memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags {
    pub local_write: bool,
    pub remote_read: bool,
    pub remote_write: bool,
    pub remote_atomic: bool,
}

impl AccessFlags {
    /// Local write plus remote read/write/atomic over the whole region
    pub const FULL_REMOTE: Self = Self {
        local_write: true,
        remote_read: true,
        remote_write: true,
        remote_atomic: true,
    };
}

/// Keys assigned by the fabric to a registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// A registered, fabric-visible memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

impl MemoryRegion {
    pub fn keys(&self) -> RegionKeys {
        RegionKeys {
            lkey: self.lkey,
            rkey: self.rkey,
        }
    }
}

/// A single scatter/gather element of a work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGather {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Work completion status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WrFlushError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    Other(u32),
}

/// Operation a completion refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// A completed work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
}

/// Outcome of a single non-blocking completion queue check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPoll {
    /// Nothing completed since the last poll
    Empty,
    Success { wr_id: u64 },
    Failed { status: WcStatus, wr_id: u64 },
}

impl CompletionPoll {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionPoll::Success { .. })
    }
}

impl From<WorkCompletion> for CompletionPoll {
    fn from(wc: WorkCompletion) -> Self {
        match wc.status {
            WcStatus::Success => CompletionPoll::Success { wr_id: wc.wr_id },
            status => CompletionPoll::Failed {
                status,
                wr_id: wc.wr_id,
            },
        }
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Entry point of a fabric: hands out connection manager channels
pub trait Fabric: Send + Sync {
    /// Human readable fabric name for logs
    fn name(&self) -> &str;

    /// Create a connection manager event channel with one listening id
    fn create_event_channel(&self) -> Result<Box<dyn EventChannel>>;
}

/// A connection manager channel and its listening id
pub trait EventChannel: Send {
    fn bind(&mut self, port: u16) -> Result<()>;

    fn listen(&mut self, backlog: u32) -> Result<()>;

    /// Wait up to `timeout` for the next event
    fn next_event(&mut self, timeout: Duration) -> Result<Option<CmEvent>>;

    /// Allocate protection domain, completion queue and queue pair for a
    /// requested connection, then accept it
    fn accept(&mut self, id: ConnectionId, qp: &QueuePairConfig) -> Result<Box<dyn Endpoint>>;
}

/// An accepted, connected queue pair
pub trait Endpoint: Send {
    /// Local queue pair number
    fn qp_num(&self) -> u32;

    /// Register `length` bytes at `addr` with the given access rights
    ///
    /// # Safety
    /// The memory must be valid for reads and writes of `length` bytes,
    /// 4-byte aligned, only accessed through atomics by Rust code, and must
    /// stay mapped until [`Endpoint::deregister_region`] is called or the
    /// endpoint is dropped.
    unsafe fn register_region(
        &mut self,
        addr: NonNull<u8>,
        length: usize,
        access: AccessFlags,
    ) -> Result<RegionKeys>;

    fn deregister_region(&mut self, keys: RegionKeys) -> Result<()>;

    /// Post a SEND of one scatter/gather element
    fn post_send(&mut self, wr_id: u64, sge: ScatterGather, signaled: bool) -> Result<()>;

    /// Non-blocking poll of one completion
    fn poll_completion(&mut self) -> Result<Option<WorkCompletion>>;

    /// Current receive-queue packet sequence number
    fn receive_psn(&self) -> Result<u32>;

    fn disconnect(&mut self) -> Result<()>;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Shared flag that aborts blocking session waits
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can guard a new attempt
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
