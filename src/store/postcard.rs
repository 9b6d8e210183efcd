//! Multi-hop "postcard" record store
//!
//! No hashing: the external pipeline writes record `i` at
//! `base + i * 32`, and readers index the same way.

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::{CollectorError, Result};
use crate::transport::Fabric;

use super::{AddressableSlotStore, PostcardSlot, StorageArea, StoreCore};

/// Positionally addressed eight-word records
pub struct MultiHopRecordStore {
    core: StoreCore<PostcardSlot>,
}

impl MultiHopRecordStore {
    /// Create the store
    ///
    /// Initiation never clears the storage; call `clear_storage()`
    /// when a clean slate is needed.
    pub fn new(config: StoreConfig, fabric: Arc<dyn Fabric>) -> Result<Self> {
        Ok(Self {
            core: StoreCore::new(config, fabric, false)?,
        })
    }

    pub fn storage(&self) -> Result<&StorageArea<PostcardSlot>> {
        self.core.storage()
    }

    /// Record at `index`
    pub fn record(&self, index: u64) -> Result<PostcardSlot> {
        let storage = self.storage()?;
        storage.get(index).ok_or(CollectorError::IndexOutOfRange {
            index,
            capacity: storage.capacity(),
        })
    }
}

impl AddressableSlotStore for MultiHopRecordStore {
    type Slot = PostcardSlot;

    fn core(&self) -> &StoreCore<PostcardSlot> {
        &self.core
    }
}
