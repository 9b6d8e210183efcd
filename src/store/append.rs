//! Circular append log
//!
//! The external writer appends one word per entry at `base + i * 4`,
//! wrapping at `capacity`. Readers follow with a cursor that wraps the same
//! way.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::diagnostics::{self, EmptySpan, PullBenchmark, SequenceGap};
use crate::error::{CollectorError, Result};
use crate::transport::Fabric;

use super::{AddressableSlotStore, AppendSlot, StorageArea, StoreCore};

/// Single-word slots read through a wrap-around cursor
///
/// `pull()` shares one cursor between all callers and serializes them; use
/// [`CircularAppendLog::cursor`] for independent per-thread cursors.
pub struct CircularAppendLog {
    core: StoreCore<AppendSlot>,
    tail: Mutex<u64>,
}

impl CircularAppendLog {
    /// Create the log; storage is zeroed once initiated
    pub fn new(config: StoreConfig, fabric: Arc<dyn Fabric>) -> Result<Self> {
        let capacity = config.capacity;
        Ok(Self {
            core: StoreCore::new(config, fabric, true)?,
            // One past the end, so the first pull lands on index 0
            tail: Mutex::new(capacity),
        })
    }

    pub fn storage(&self) -> Result<&StorageArea<AppendSlot>> {
        self.core.storage()
    }

    /// Advance the shared cursor and read the entry under it
    pub fn pull(&self) -> Result<u32> {
        let storage = self.storage()?;
        let mut tail = self.tail.lock();
        *tail = advance(*tail, storage.capacity());
        Ok(storage.get(*tail).map_or(0, |slot| slot.value))
    }

    /// Index the shared cursor last read (`capacity` before the first pull)
    pub fn tail_pointer(&self) -> u64 {
        *self.tail.lock()
    }

    /// A private cursor starting before index 0
    pub fn cursor(&self) -> Result<AppendCursor<'_>> {
        let storage = self.storage()?;
        Ok(AppendCursor {
            storage,
            position: storage.capacity(),
        })
    }

    /// Consecutive non-zero entries that are not successive integers
    pub fn find_sequence_gaps(&self) -> Result<Vec<SequenceGap>> {
        let gaps = diagnostics::find_sequence_gaps(self.storage()?);
        tracing::info!("'{}' has {} sequence gap(s)", self.name(), gaps.len());
        Ok(gaps)
    }

    /// Runs of empty slots, optionally merged across the wrap point
    pub fn find_empty_spans(&self, circular: bool) -> Result<Vec<EmptySpan>> {
        let spans = diagnostics::find_empty_spans(self.storage()?, circular);
        tracing::info!("'{}' has {} empty span(s)", self.name(), spans.len());
        Ok(spans)
    }

    /// Pull `pulls` entries through the shared cursor
    pub fn benchmark_pulls(&self, pulls: u64) -> Result<PullBenchmark> {
        tracing::info!("'{}' starts pulling {} entries", self.name(), pulls);

        let started = Instant::now();
        for _ in 0..pulls {
            std::hint::black_box(self.pull()?);
        }
        let elapsed = started.elapsed();

        Ok(PullBenchmark {
            logs: 1,
            pulls_per_log: pulls,
            elapsed,
        })
    }

    /// Pull `pulls` entries from every log in parallel, one thread per log
    pub fn benchmark_parallel(logs: &[Arc<CircularAppendLog>], pulls: u64) -> Result<PullBenchmark> {
        if let Some(log) = logs.iter().find(|log| !log.is_ready()) {
            return Err(CollectorError::NotReady(log.name().to_string()));
        }

        let started = Instant::now();
        let results = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = logs
                .iter()
                .map(|log| scope.spawn(move |_| log.benchmark_pulls(pulls)))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        })
        .map_err(|_| CollectorError::Worker("benchmark scope panicked".to_string()))?;

        for result in results {
            result.map_err(|_| CollectorError::Worker("pull thread panicked".to_string()))??;
        }

        let report = PullBenchmark {
            logs: logs.len(),
            pulls_per_log: pulls,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "{} log(s) pulled {} entries each in {:?}: {:.3} M pulls/s total",
            report.logs,
            pulls,
            report.elapsed,
            report.pulls_per_second() / 1e6
        );
        Ok(report)
    }
}

impl AddressableSlotStore for CircularAppendLog {
    type Slot = AppendSlot;

    fn core(&self) -> &StoreCore<AppendSlot> {
        &self.core
    }
}

/// An independent read cursor over a log's storage
pub struct AppendCursor<'a> {
    storage: &'a StorageArea<AppendSlot>,
    position: u64,
}

impl AppendCursor<'_> {
    pub fn pull(&mut self) -> u32 {
        self.position = advance(self.position, self.storage.capacity());
        self.storage.get(self.position).map_or(0, |slot| slot.value)
    }

    /// Index last read (`capacity` before the first pull)
    pub fn position(&self) -> u64 {
        self.position
    }
}

fn advance(position: u64, capacity: u64) -> u64 {
    let next = position + 1;
    if next >= capacity {
        0
    } else {
        next
    }
}
