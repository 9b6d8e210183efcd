//! Diagnostics Module
//!
//! Read-only inspection of slot storage, used for verification and
//! benchmarking.
//!
//! ## Responsibilities
//! - Fullness scan: occupied slots and load factor
//! - Gap detection over append logs (by value sequence and by occupancy)
//! - Benchmark reports for key/value queries and log pulls
//!
//! Every scan is O(capacity) and may run while remote writers are active;
//! results are a point-in-time approximation.

mod bench;
mod scan;

pub use bench::{PullBenchmark, QueryBenchmark};
pub use scan::{analyze, find_empty_spans, find_sequence_gaps, Analysis, EmptySpan, SequenceGap};
