//! Configuration for collector stores
//!
//! Centralized configuration with the reference deployment's defaults.

use std::time::Duration;

/// Huge page granularity used when rounding allocations (1 GiB)
pub const HUGE_PAGE_SIZE: usize = 1 << 30;

/// Ordinary page granularity
pub const STANDARD_PAGE_SIZE: usize = 4096;

/// Largest slot count the translator pipeline can address (2^29)
pub const MAX_PIPELINE_SLOTS: u64 = 1 << 29;

/// Configuration of a single slot store and its transport session
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------
    /// Name used in logs and diagnostics
    pub name: String,

    /// Port the connection manager listens on
    pub port: u16,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Number of slots (must be a power of two)
    pub capacity: u64,

    /// Which pages back the storage area
    pub page_policy: PagePolicy,

    /// Emit a progress trace every this many slots during full scans
    pub progress_interval: u64,

    // -------------------------------------------------------------------------
    // Transport Configuration
    // -------------------------------------------------------------------------
    pub session: SessionConfig,
}

/// Page backing for storage allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePolicy {
    /// MAP_HUGETLB, rounded up to whole huge pages. Fails if none are reserved.
    HugePages { page_size: usize },

    /// Ordinary anonymous pages (tests, benches, hosts without huge pages)
    Standard,
}

impl PagePolicy {
    /// Allocation granularity in bytes
    pub fn page_size(&self) -> usize {
        match self {
            PagePolicy::HugePages { page_size } => *page_size,
            PagePolicy::Standard => STANDARD_PAGE_SIZE,
        }
    }
}

impl Default for PagePolicy {
    fn default() -> Self {
        PagePolicy::HugePages {
            page_size: HUGE_PAGE_SIZE,
        }
    }
}

/// Transport session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection backlog passed to listen
    pub listen_backlog: u32,

    /// Queue pair and completion queue sizing
    pub queue_pair: QueuePairConfig,

    /// Upper bound for each connection manager wait (`None` waits forever)
    pub event_timeout: Option<Duration>,

    /// Granularity of event polling; the cancel token is checked this often
    pub event_poll_interval: Duration,

    /// How long to wait for the peer to acknowledge the metadata send
    pub advertise_ack_timeout: Duration,

    /// Extra delay after the acknowledgment before the metadata is zeroed
    pub advertise_settle: Duration,
}

/// Queue pair capabilities requested at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePairConfig {
    pub cq_size: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            cq_size: 128,
            max_send_wr: 32,
            max_recv_wr: 32,
            max_send_sge: 32,
            max_recv_sge: 32,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_backlog: 1,
            queue_pair: QueuePairConfig::default(),
            event_timeout: None,
            event_poll_interval: Duration::from_millis(10),
            advertise_ack_timeout: Duration::from_secs(2),
            advertise_settle: Duration::ZERO,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            port: 1337,
            capacity: 256,
            page_policy: PagePolicy::default(),
            progress_interval: 1_000_000,
            session: SessionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the store name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the listening port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the slot count
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the page policy
    pub fn page_policy(mut self, policy: PagePolicy) -> Self {
        self.config.page_policy = policy;
        self
    }

    /// Back storage with ordinary pages
    pub fn standard_pages(self) -> Self {
        self.page_policy(PagePolicy::Standard)
    }

    /// Set the scan progress interval (in slots)
    pub fn progress_interval(mut self, slots: u64) -> Self {
        self.config.progress_interval = slots.max(1);
        self
    }

    /// Bound every connection manager wait
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.event_timeout = Some(timeout);
        self
    }

    /// Set the metadata acknowledgment timeout
    pub fn advertise_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.advertise_ack_timeout = timeout;
        self
    }

    /// Set the delay between acknowledgment and zeroing of the metadata
    pub fn advertise_settle(mut self, delay: Duration) -> Self {
        self.config.session.advertise_settle = delay;
        self
    }

    /// Replace the whole session configuration
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
