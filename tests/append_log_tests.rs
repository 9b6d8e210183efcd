//! Tests for the circular append log
//!
//! These tests verify:
//! - The shared cursor visits every index once per lap and wraps to 0
//! - Independent cursors do not disturb each other
//! - Gap and empty-span reports over remotely written entries
//! - Parallel pull benchmarks across several logs

mod common;

use std::sync::Arc;

use common::{connect, fabric, write};
use dta_collector::diagnostics::{EmptySpan, SequenceGap};
use dta_collector::store::AppendSlot;
use dta_collector::transport::RegionMetadata;
use dta_collector::{AddressableSlotStore, CircularAppendLog, CollectorError, LoopbackFabric, RemotePeer};

// =============================================================================
// Helper Functions
// =============================================================================

fn ready_log(port: u16, capacity: u64) -> (LoopbackFabric, Arc<CircularAppendLog>, RemotePeer, RegionMetadata) {
    let (fabric, shared) = fabric();
    let log = Arc::new(CircularAppendLog::new(common::config("log", port, capacity), shared).unwrap());
    let (peer, metadata) = connect(&fabric, &log);
    (fabric, log, peer, metadata)
}

fn write_values(peer: &RemotePeer, metadata: &RegionMetadata, values: &[u32]) {
    for (index, &value) in values.iter().enumerate() {
        write(peer, metadata, index as u64, &AppendSlot { value });
    }
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_pull_visits_each_index_once_per_lap() {
    let (_fabric, log, peer, metadata) = ready_log(9500, 8);
    write_values(&peer, &metadata, &[10, 11, 12, 13, 14, 15, 16, 17]);

    assert_eq!(log.tail_pointer(), 8);

    let first_lap: Vec<u32> = (0..8).map(|_| log.pull().unwrap()).collect();
    assert_eq!(first_lap, vec![10, 11, 12, 13, 14, 15, 16, 17]);
    assert_eq!(log.tail_pointer(), 7);

    // Wraps back to index 0
    assert_eq!(log.pull().unwrap(), 10);
    assert_eq!(log.tail_pointer(), 0);
}

#[test]
fn test_pull_from_empty_slots_returns_zero() {
    let (_fabric, log, _peer, _metadata) = ready_log(9501, 4);

    for _ in 0..6 {
        assert_eq!(log.pull().unwrap(), 0);
    }
}

#[test]
fn test_private_cursors_are_independent() {
    let (_fabric, log, peer, metadata) = ready_log(9502, 4);
    write_values(&peer, &metadata, &[1, 2, 3, 4]);

    let mut a = log.cursor().unwrap();
    let mut b = log.cursor().unwrap();

    assert_eq!(a.pull(), 1);
    assert_eq!(a.pull(), 2);
    assert_eq!(b.pull(), 1);
    assert_eq!(a.position(), 1);
    assert_eq!(b.position(), 0);

    // The shared cursor has not moved
    assert_eq!(log.tail_pointer(), 4);
}

#[test]
fn test_pull_before_ready_fails() {
    let (_fabric, shared) = fabric();
    let log = CircularAppendLog::new(common::config("idle", 9503, 4), shared).unwrap();

    assert!(matches!(log.pull(), Err(CollectorError::NotReady(_))));
    assert!(log.cursor().is_err());
    assert!(matches!(log.find_sequence_gaps(), Err(CollectorError::NotReady(_))));
}

// =============================================================================
// Diagnostics Tests
// =============================================================================

#[test]
fn test_empty_spans_of_partially_written_log() {
    let (_fabric, log, peer, metadata) = ready_log(9600, 4);
    write_values(&peer, &metadata, &[0, 5, 6, 0]);

    assert_eq!(
        log.find_empty_spans(false).unwrap(),
        vec![EmptySpan { first: 0, last: 0 }, EmptySpan { first: 3, last: 3 }]
    );

    let merged = log.find_empty_spans(true).unwrap();
    assert_eq!(merged, vec![EmptySpan { first: 3, last: 0 }]);
    assert_eq!(merged[0].len(4), 2);
}

#[test]
fn test_sequence_gaps_of_wrapped_writer() {
    let (_fabric, log, peer, metadata) = ready_log(9601, 8);

    // A writer that made it to 10 in an 8-slot log, having lost entry 4
    write_values(&peer, &metadata, &[9, 10, 3, 0, 5, 6, 7, 8]);

    let gaps = log.find_sequence_gaps().unwrap();
    assert_eq!(
        gaps,
        vec![
            SequenceGap { index: 0, prev: 0, next: 9 },
            SequenceGap { index: 2, prev: 10, next: 3 },
            SequenceGap { index: 4, prev: 3, next: 5 },
        ]
    );
}

#[test]
fn test_analyze_and_clear() {
    let (_fabric, log, peer, metadata) = ready_log(9602, 16);
    write_values(&peer, &metadata, &[1, 2, 3, 4, 5]);

    assert_eq!(log.analyze().unwrap().occupied, 5);
    assert!(log.clear_storage());
    assert_eq!(log.analyze().unwrap().occupied, 0);
    assert_eq!(log.find_empty_spans(true).unwrap(), vec![EmptySpan { first: 0, last: 15 }]);
}

// =============================================================================
// Benchmark Tests
// =============================================================================

#[test]
fn test_benchmark_pulls_advances_cursor() {
    let (_fabric, log, _peer, _metadata) = ready_log(9700, 8);

    let report = log.benchmark_pulls(20).unwrap();
    assert_eq!(report.logs, 1);
    assert_eq!(report.total_pulls(), 20);
    // 20 pulls from "before 0" end on index 19 % 8
    assert_eq!(log.tail_pointer(), 3);
}

#[test]
fn test_parallel_benchmark_across_logs() {
    let (fabric, shared) = fabric();
    let mut logs = Vec::new();
    let mut peers = Vec::new();
    for i in 0..3u16 {
        let log = Arc::new(CircularAppendLog::new(common::config(&format!("List{}", i), 9800 + i, 16), Arc::clone(&shared)).unwrap());
        peers.push(connect(&fabric, &log));
        logs.push(log);
    }

    let report = CircularAppendLog::benchmark_parallel(&logs, 100).unwrap();
    assert_eq!(report.logs, 3);
    assert_eq!(report.total_pulls(), 300);
    for log in &logs {
        assert_eq!(log.tail_pointer(), 99 % 16);
    }
}

#[test]
fn test_parallel_benchmark_needs_ready_logs() {
    let (_fabric, shared) = fabric();
    let log = Arc::new(CircularAppendLog::new(common::config("cold", 9900, 16), shared).unwrap());

    assert!(matches!(
        CircularAppendLog::benchmark_parallel(&[log], 10),
        Err(CollectorError::NotReady(_))
    ));
}
