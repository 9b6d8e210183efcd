//! Hash-addressed key/value store
//!
//! Remote writers place `{CRC32(key), value}` into one or more of the key's
//! candidate slots; lookups walk the same candidates in order and stop at the
//! first slot whose checksum matches.

use std::sync::Arc;
use std::time::Instant;

use crate::config::StoreConfig;
use crate::diagnostics::QueryBenchmark;
use crate::error::{CollectorError, Result};
use crate::transport::Fabric;

use super::addressing::{key_checksum, probe_index};
use super::{AddressableSlotStore, KeyValueSlot, StorageArea, StoreCore};

/// Number of distinct u32 keys
const KEY_SPACE: u64 = u32::MAX as u64 + 1;

/// Key/value slots addressed by bounded multi-probe CRC32 hashing
pub struct HashKeyValueStore {
    core: StoreCore<KeyValueSlot>,
}

impl HashKeyValueStore {
    /// Create the store; storage starts zeroed once initiated
    pub fn new(config: StoreConfig, fabric: Arc<dyn Fabric>) -> Result<Self> {
        Ok(Self {
            core: StoreCore::new(config, fabric, true)?,
        })
    }

    pub fn storage(&self) -> Result<&StorageArea<KeyValueSlot>> {
        self.core.storage()
    }

    /// Value stored for `key`, or 0 when none of the first `redundancy`
    /// candidates carries its checksum
    ///
    /// A miss and a stored 0 look the same.
    pub fn query(&self, key: u32, redundancy: u8) -> Result<u32> {
        Ok(self.locate(key, redundancy)?.map_or(0, |(_, value)| value))
    }

    /// Slot index and value of the first matching candidate
    pub fn locate(&self, key: u32, redundancy: u8) -> Result<Option<(u64, u32)>> {
        Ok(lookup(self.storage()?, key, redundancy))
    }

    /// Query keys `0..num_queries` from `threads` threads
    ///
    /// Thread `t` takes keys `t, t + threads, t + 2 * threads, ...`.
    /// Read-only; safe to run while remote writers are active. At most
    /// 2^32 queries, one per key.
    pub fn benchmark_queries(&self, threads: usize, num_queries: u64, redundancy: u8) -> Result<QueryBenchmark> {
        if threads == 0 {
            return Err(CollectorError::Config("Benchmark needs at least one thread".to_string()));
        }
        // Keys are u32; more queries would revisit keys
        if num_queries > KEY_SPACE {
            return Err(CollectorError::Config(format!(
                "Benchmark of {} queries exceeds the {} distinct keys",
                num_queries, KEY_SPACE
            )));
        }
        let storage = self.storage()?;

        tracing::info!(
            "Benchmarking '{}' with {} thread(s), {} queries, redundancy {}",
            self.name(),
            threads,
            num_queries,
            redundancy
        );

        let started = Instant::now();
        let per_thread = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|offset| {
                    scope.spawn(move |_| {
                        let mut hits = 0u64;
                        let mut key = offset as u64;
                        while key < num_queries {
                            let found = lookup(storage, key as u32, redundancy);
                            if std::hint::black_box(found).is_some() {
                                hits += 1;
                            }
                            key += threads as u64;
                        }
                        hits
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        })
        .map_err(|_| CollectorError::Worker("benchmark scope panicked".to_string()))?;

        let elapsed = started.elapsed();
        let mut hits = 0;
        for result in per_thread {
            hits += result.map_err(|_| CollectorError::Worker("query thread panicked".to_string()))?;
        }

        let report = QueryBenchmark {
            threads,
            queries: num_queries,
            hits,
            elapsed,
        };
        tracing::info!(
            "{} thread(s) ran {} queries in {:?}: {:.3} M queries/s total",
            threads,
            num_queries,
            elapsed,
            report.queries_per_second() / 1e6
        );
        Ok(report)
    }
}

impl AddressableSlotStore for HashKeyValueStore {
    type Slot = KeyValueSlot;

    fn core(&self) -> &StoreCore<KeyValueSlot> {
        &self.core
    }
}

/// Walk the candidate slots of `key` and return the first checksum match
fn lookup(storage: &StorageArea<KeyValueSlot>, key: u32, redundancy: u8) -> Option<(u64, u32)> {
    let expected = key_checksum(key);
    let capacity = storage.capacity();

    (0..redundancy).find_map(|n| {
        let index = probe_index(key, n, capacity);
        let slot = storage.get(index)?;
        tracing::trace!("Key {} probe {} -> slot {}: {:?}", key, n, index, slot);
        (slot.checksum == expected).then_some((index, slot.value))
    })
}
