//! Store Module
//!
//! Slot stores exposed to remote peers through a registered region.
//!
//! ## Responsibilities
//! - Validate capacity (power of two, advisory pipeline ceiling)
//! - Drive the transport session and allocate storage in `initiate()`
//! - Publish readiness once, atomically, after every step succeeded
//! - Serve local queries and diagnostics once ready
//!
//! ## Stores
//! | Store                 | Slot               | Addressing                 |
//! |-----------------------|--------------------|----------------------------|
//! | `HashKeyValueStore`   | checksum + value   | CRC32 multi-probe          |
//! | `MultiHopRecordStore` | 5 hops + 3 padding | `index * 32`               |
//! | `CircularAppendLog`   | value              | `index * 4`, cursor-driven |

mod addressing;
mod append;
mod keyvalue;
mod postcard;
mod slot;

pub use addressing::{key_bytes, key_checksum, probe_index, probe_sequence};
pub use append::{AppendCursor, CircularAppendLog};
pub use keyvalue::HashKeyValueStore;
pub use postcard::MultiHopRecordStore;
pub use slot::{AppendSlot, KeyValueSlot, PostcardSlot, Slot, StorageArea, HOP_COUNT, MAX_SLOT_WORDS};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::{StoreConfig, MAX_PIPELINE_SLOTS};
use crate::diagnostics::{self, Analysis};
use crate::error::{CollectorError, Result};
use crate::memory::PinnedBufferAllocator;
use crate::transport::{CancelToken, CompletionPoll, Fabric, RdmaInfo, TransportSession, METADATA_LEN};

/// Capability contract shared by all slot stores
///
/// Implementors only provide [`AddressableSlotStore::core`]; lifecycle and
/// diagnostics come from the shared [`StoreCore`].
pub trait AddressableSlotStore: Send + Sync {
    type Slot: Slot;

    fn core(&self) -> &StoreCore<Self::Slot>;

    fn name(&self) -> &str {
        &self.core().config().name
    }

    fn port(&self) -> u16 {
        self.core().config().port
    }

    fn capacity(&self) -> u64 {
        self.core().config().capacity
    }

    fn slot_size(&self) -> usize {
        <Self::Slot as Slot>::SIZE
    }

    /// `capacity * slot_size` in bytes
    fn buffer_size(&self) -> u64 {
        self.capacity() * self.slot_size() as u64
    }

    fn is_ready(&self) -> bool {
        self.core().is_ready()
    }

    /// Connect, allocate, register and advertise; all or nothing
    fn initiate(&self) -> Result<()> {
        self.core().initiate()
    }

    /// Zero every slot; returns false (with a warning) before allocation
    fn clear_storage(&self) -> bool {
        self.core().clear_storage()
    }

    /// Occupied slots and load factor
    fn analyze(&self) -> Result<Analysis> {
        self.core().analyze()
    }

    fn rdma_info(&self) -> Result<RdmaInfo> {
        self.core().rdma_info()
    }

    /// Non-blocking completion queue check
    fn poll_completion(&self) -> Result<CompletionPoll> {
        self.core().poll_completion()
    }

    /// Copy of up to `limit` slots starting at `start`
    fn snapshot(&self, start: u64, limit: usize) -> Result<Vec<Self::Slot>> {
        self.core().snapshot(start, limit)
    }

    /// Token that aborts a blocking `initiate()`
    fn cancel_token(&self) -> CancelToken {
        self.core().cancel_token()
    }

    /// Run `initiate()` on a dedicated worker thread
    fn spawn_initiate(self: Arc<Self>) -> Result<JoinHandle<Result<()>>>
    where
        Self: Sized + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("init-{}", self.name()))
            .spawn(move || self.initiate())?;
        Ok(handle)
    }
}

/// Lifecycle shared by every store
///
/// ## Concurrency
/// - `active` is written once, at the end of a successful `initiate()`,
///   and read lock-free afterwards; readiness is "`active` is set"
/// - `initiating` rejects a second concurrent `initiate()`
/// - the session sits behind a mutex for completion polling
pub struct StoreCore<S: Slot> {
    config: StoreConfig,
    fabric: Arc<dyn Fabric>,
    zero_on_initiate: bool,
    cancel: CancelToken,
    initiating: AtomicBool,
    active: OnceLock<Active<S>>,
}

/// What a successful `initiate()` leaves behind
struct Active<S: Slot> {
    session: Mutex<TransportSession>,
    storage: StorageArea<S>,
}

impl<S: Slot> StoreCore<S> {
    /// Validate the configuration; nothing is allocated yet
    ///
    /// `zero_on_initiate` clears the storage before it is registered.
    pub fn new(config: StoreConfig, fabric: Arc<dyn Fabric>, zero_on_initiate: bool) -> Result<Self> {
        let capacity = config.capacity;

        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(CollectorError::Config(format!(
                "Capacity of '{}' must be a power of two, got {}",
                config.name, capacity
            )));
        }

        if capacity.saturating_mul(S::SIZE as u64) < METADATA_LEN as u64 {
            return Err(CollectorError::Config(format!(
                "'{}' needs at least {} bytes of storage to advertise its region",
                config.name, METADATA_LEN
            )));
        }

        if capacity > MAX_PIPELINE_SLOTS {
            tracing::warn!(
                "Translator pipeline supports at most {} entries, '{}' allocates {}",
                MAX_PIPELINE_SLOTS,
                config.name,
                capacity
            );
        }

        tracing::debug!(
            "Constructed '{}': {} slots of {} bytes on port {}",
            config.name,
            capacity,
            S::SIZE,
            config.port
        );

        Ok(Self {
            config,
            fabric,
            zero_on_initiate,
            cancel: CancelToken::new(),
            initiating: AtomicBool::new(false),
            active: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.active.get().is_some()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Allocate `capacity * slot_size` bytes with the configured page policy
    pub fn allocate_storage(&self) -> Result<StorageArea<S>> {
        tracing::info!(
            "Allocating storage for '{}'... Entries: {} size(B): {}",
            self.config.name,
            self.config.capacity,
            self.config.capacity * S::SIZE as u64
        );

        let allocator = PinnedBufferAllocator::new(self.config.page_policy);
        let storage = StorageArea::allocate(&allocator, self.config.capacity)?;

        tracing::debug!("'{}' buffer starts at {:#x}", self.config.name, storage.addr());
        Ok(storage)
    }

    /// Run the whole setup sequence
    ///
    /// Steps:
    /// 1. Listen and accept one peer
    /// 2. Allocate storage and zero it if the store's policy says so
    /// 3. Register it with the fabric
    /// 4. Advertise the region and capture the initial PSN
    ///
    /// Nothing touches the storage after advertisement, so writes the
    /// peer issues right after receiving the metadata are kept.
    ///
    /// On failure everything acquired so far is dropped (region
    /// deregistered, endpoint disconnected, port released, memory unmapped)
    /// and the store stays not-ready; `initiate()` may be called again.
    pub fn initiate(&self) -> Result<()> {
        if self.is_ready() {
            return Err(CollectorError::InvalidState {
                expected: "not initiated",
                actual: "Ready",
            });
        }
        if self.initiating.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::InvalidState {
                expected: "not initiated",
                actual: "initiating",
            });
        }

        tracing::info!("Initiating storage for '{}'", self.config.name);
        let result = self.setup();
        self.initiating.store(false, Ordering::SeqCst);

        match result {
            Ok(active) => {
                if self.active.set(active).is_err() {
                    return Err(CollectorError::InvalidState {
                        expected: "not initiated",
                        actual: "Ready",
                    });
                }
                tracing::info!("'{}' is ready", self.config.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to initiate '{}': {}", self.config.name, e);
                Err(e)
            }
        }
    }

    fn setup(&self) -> Result<Active<S>> {
        let mut session = TransportSession::new(
            self.config.name.clone(),
            Arc::clone(&self.fabric),
            self.config.session.clone(),
        )
        .with_cancel_token(self.cancel.clone());

        session.listen_and_accept(self.config.port)?;

        let storage = self.allocate_storage()?;
        // The peer may write as soon as the metadata is out
        if self.zero_on_initiate {
            storage.clear();
        }
        session.register_region(Arc::clone(storage.buffer()))?;
        session.advertise_metadata()?;
        session.capture_initial_sequence_number()?;

        Ok(Active {
            session: Mutex::new(session),
            storage,
        })
    }

    /// The storage area, once ready
    pub fn storage(&self) -> Result<&StorageArea<S>> {
        self.active
            .get()
            .map(|active| &active.storage)
            .ok_or_else(|| CollectorError::NotReady(self.config.name.clone()))
    }

    pub fn clear_storage(&self) -> bool {
        match self.active.get() {
            Some(active) => {
                tracing::info!("Clearing storage of '{}'", self.config.name);
                active.storage.clear();
                true
            }
            None => {
                tracing::warn!("Storage of '{}' is not initialized, skipping clear", self.config.name);
                false
            }
        }
    }

    pub fn analyze(&self) -> Result<Analysis> {
        let storage = self.storage()?;
        tracing::info!(
            "Analyzing '{}'... Total slots to iterate over: {}",
            self.config.name,
            storage.capacity()
        );
        let analysis = diagnostics::analyze(storage, self.config.progress_interval);
        tracing::info!(
            "'{}': {} / {} slots in use, load factor {:.2}%",
            self.config.name,
            analysis.occupied,
            analysis.capacity,
            analysis.load_factor_percent()
        );
        Ok(analysis)
    }

    pub fn rdma_info(&self) -> Result<RdmaInfo> {
        self.active()?.session.lock().rdma_info()
    }

    pub fn poll_completion(&self) -> Result<CompletionPoll> {
        self.active()?.session.lock().poll_once()
    }

    pub fn snapshot(&self, start: u64, limit: usize) -> Result<Vec<S>> {
        let storage = self.storage()?;
        let end = start.saturating_add(limit as u64).min(storage.capacity());
        Ok((start..end).filter_map(|i| storage.get(i)).collect())
    }

    fn active(&self) -> Result<&Active<S>> {
        self.active
            .get()
            .ok_or_else(|| CollectorError::NotReady(self.config.name.clone()))
    }
}
