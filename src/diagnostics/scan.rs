//! Storage scans
//!
//! All scans treat an all-zero slot as empty.

use crate::store::{AppendSlot, Slot, StorageArea};

/// Result of a fullness scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysis {
    pub occupied: u64,
    pub capacity: u64,
}

impl Analysis {
    /// Occupied / capacity, in `0.0..=1.0`
    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.occupied as f64 / self.capacity as f64
    }

    pub fn load_factor_percent(&self) -> f64 {
        self.load_factor() * 100.0
    }

    pub fn empty(&self) -> u64 {
        self.capacity - self.occupied
    }
}

/// Two consecutive non-zero log entries that are not successive integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Index of the entry that broke the sequence
    pub index: u64,
    pub prev: u32,
    pub next: u32,
}

/// A run of empty slots, inclusive on both ends
///
/// `first > last` means the run wraps from the end of storage to the start.
/// For circular reports the written slots around the run sit at `first - 1`
/// and `last + 1` modulo capacity; [`EmptySpan::neighbours`] computes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptySpan {
    pub first: u64,
    pub last: u64,
}

impl EmptySpan {
    pub fn wraps(&self) -> bool {
        self.first > self.last
    }

    /// Number of slots in the span for storage of `capacity` slots
    pub fn len(&self, capacity: u64) -> u64 {
        if self.wraps() {
            capacity - self.first + self.last + 1
        } else {
            self.last - self.first + 1
        }
    }

    /// Indices just before and just after the span, wrapping at `capacity`
    ///
    /// In a circular report both are written slots. `None` when the span
    /// covers the whole storage.
    pub fn neighbours(&self, capacity: u64) -> Option<(u64, u64)> {
        if capacity == 0 || self.len(capacity) >= capacity {
            return None;
        }
        let before = (self.first + capacity - 1) % capacity;
        let after = (self.last + 1) % capacity;
        Some((before, after))
    }
}

/// Count occupied slots, tracing progress every `progress_interval` slots
pub fn analyze<S: Slot>(storage: &StorageArea<S>, progress_interval: u64) -> Analysis {
    let capacity = storage.capacity();
    let interval = progress_interval.max(1);
    let mut occupied = 0;

    for (index, slot) in (0u64..).zip(storage.iter()) {
        if index % interval == 0 && index > 0 {
            tracing::debug!("Scanned {} / {} slots", index, capacity);
        }
        if !slot.is_empty() {
            occupied += 1;
        }
    }

    Analysis { occupied, capacity }
}

/// Report where an increasing sequence written by the producer skips values
///
/// Empty slots are ignored. The first non-zero entry is compared against 0,
/// so a log that does not start at 1 reports a gap at its first entry.
pub fn find_sequence_gaps(storage: &StorageArea<AppendSlot>) -> Vec<SequenceGap> {
    let mut gaps = Vec::new();
    let mut last = 0u32;

    for (index, slot) in (0u64..).zip(storage.iter()) {
        if slot.is_empty() {
            continue;
        }
        if slot.value != last.wrapping_add(1) {
            tracing::trace!("Sequence gap at {}: ({}, {})", index, last, slot.value);
            gaps.push(SequenceGap {
                index,
                prev: last,
                next: slot.value,
            });
        }
        last = slot.value;
    }

    gaps
}

/// Runs of empty slots in index order
///
/// With `circular`, a run touching the last index and a run touching index 0
/// are reported as one wrapping span, matching a writer that wraps around.
pub fn find_empty_spans<S: Slot>(storage: &StorageArea<S>, circular: bool) -> Vec<EmptySpan> {
    let mut spans = Vec::new();
    let mut run_start: Option<u64> = None;
    let mut last_index = 0;

    for (index, slot) in (0u64..).zip(storage.iter()) {
        last_index = index;
        match (slot.is_empty(), run_start) {
            (true, None) => run_start = Some(index),
            (false, Some(first)) => {
                spans.push(EmptySpan {
                    first,
                    last: index - 1,
                });
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(first) = run_start {
        spans.push(EmptySpan {
            first,
            last: last_index,
        });
    }

    if circular && spans.len() >= 2 {
        let head = spans[0];
        let tail = spans[spans.len() - 1];
        if head.first == 0 && tail.last == storage.capacity() - 1 {
            spans.pop();
            spans[0] = EmptySpan {
                first: tail.first,
                last: head.last,
            };
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagePolicy;
    use crate::memory::PinnedBufferAllocator;

    fn log_with(values: &[u32]) -> StorageArea<AppendSlot> {
        let allocator = PinnedBufferAllocator::new(PagePolicy::Standard);
        let storage = StorageArea::allocate(&allocator, values.len() as u64).unwrap();
        for (i, &value) in values.iter().enumerate() {
            storage.put(i as u64, &AppendSlot { value }).unwrap();
        }
        storage
    }

    #[test]
    fn test_empty_spans_linear_and_circular() {
        let storage = log_with(&[0, 5, 6, 0]);

        assert_eq!(
            find_empty_spans(&storage, false),
            vec![EmptySpan { first: 0, last: 0 }, EmptySpan { first: 3, last: 3 }]
        );

        let circular = find_empty_spans(&storage, true);
        assert_eq!(circular, vec![EmptySpan { first: 3, last: 0 }]);
        assert!(circular[0].wraps());
        assert_eq!(circular[0].len(4), 2);
    }

    #[test]
    fn test_span_neighbours_are_written_slots() {
        let storage = log_with(&[0, 5, 6, 0]);

        let inner = find_empty_spans(&log_with(&[1, 0, 0, 2]), false);
        assert_eq!(inner[0].neighbours(4), Some((0, 3)));

        // Wrapping run over 3 and 0 sits between 6 (index 2) and 5 (index 1)
        let circular = find_empty_spans(&storage, true);
        let (before, after) = circular[0].neighbours(4).unwrap();
        assert_eq!((before, after), (2, 1));
        assert_eq!(storage.get(before), Some(AppendSlot { value: 6 }));
        assert_eq!(storage.get(after), Some(AppendSlot { value: 5 }));

        let empty = log_with(&[0, 0, 0, 0]);
        assert_eq!(find_empty_spans(&empty, true)[0].neighbours(4), None);
    }

    #[test]
    fn test_full_log_has_no_spans() {
        let storage = log_with(&[1, 2, 3, 4]);
        assert!(find_empty_spans(&storage, true).is_empty());
        assert!(find_sequence_gaps(&storage).is_empty());
    }

    #[test]
    fn test_sequence_gaps_skip_empty_slots() {
        let storage = log_with(&[1, 2, 0, 3, 7, 8, 0, 10]);

        let gaps = find_sequence_gaps(&storage);
        assert_eq!(
            gaps,
            vec![
                SequenceGap { index: 4, prev: 3, next: 7 },
                SequenceGap { index: 7, prev: 8, next: 10 },
            ]
        );
    }

    #[test]
    fn test_analysis_load_factor() {
        let storage = log_with(&[0, 9, 0, 9, 9, 0, 0, 0]);
        let analysis = analyze(&storage, 2);

        assert_eq!(analysis.occupied, 3);
        assert_eq!(analysis.empty(), 5);
        assert!((analysis.load_factor() - 0.375).abs() < f64::EPSILON);
    }
}
