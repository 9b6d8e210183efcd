//! Integration tests for the collector
//!
//! Several stores share one fabric and initiate concurrently, the way the
//! collector binary runs them.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fabric, TIMEOUT};
use dta_collector::config::{HUGE_PAGE_SIZE, STANDARD_PAGE_SIZE};
use dta_collector::store::{key_checksum, probe_sequence, AppendSlot, KeyValueSlot, PostcardSlot, Slot};
use dta_collector::{
    AddressableSlotStore, CircularAppendLog, HashKeyValueStore, MultiHopRecordStore, PagePolicy,
    StoreConfig,
};

// =============================================================================
// Collector Scenario
// =============================================================================

#[test]
fn test_stores_on_consecutive_ports_initiate_concurrently() {
    let (fabric, shared) = fabric();

    let keyvalue = Arc::new(HashKeyValueStore::new(common::config("KeyWrite", 1337, 1024), Arc::clone(&shared)).unwrap());
    let postcard = Arc::new(MultiHopRecordStore::new(common::config("Postcarder", 1336, 64), Arc::clone(&shared)).unwrap());
    let lists: Vec<Arc<CircularAppendLog>> = (0..2u16)
        .map(|i| {
            let config = common::config(&format!("List{}", i), 1338 + i, 32);
            Arc::new(CircularAppendLog::new(config, Arc::clone(&shared)).unwrap())
        })
        .collect();

    let mut handles = vec![
        Arc::clone(&keyvalue).spawn_initiate().unwrap(),
        Arc::clone(&postcard).spawn_initiate().unwrap(),
    ];
    for list in &lists {
        handles.push(Arc::clone(list).spawn_initiate().unwrap());
    }

    // Peers attach in the opposite order from the stores
    let list_peers: Vec<_> = lists
        .iter()
        .rev()
        .map(|list| {
            let peer = fabric.connect_timeout(list.port(), TIMEOUT).unwrap();
            let metadata = peer.recv_metadata(TIMEOUT).unwrap();
            (Arc::clone(list), peer, metadata)
        })
        .collect();
    let postcard_peer = fabric.connect_timeout(1336, TIMEOUT).unwrap();
    let postcard_meta = postcard_peer.recv_metadata(TIMEOUT).unwrap();
    let kv_peer = fabric.connect_timeout(1337, TIMEOUT).unwrap();
    let kv_meta = kv_peer.recv_metadata(TIMEOUT).unwrap();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert!(keyvalue.is_ready() && postcard.is_ready());
    assert!(lists.iter().all(|list| list.is_ready()));

    // Every store advertised its own region
    assert_eq!(kv_meta.length, 1024 * 8);
    assert_eq!(postcard_meta.length, 64 * 32);
    assert_ne!(kv_meta.addr, postcard_meta.addr);

    // Key/value writer with redundancy 2
    for key in 1..=16u32 {
        let slot = KeyValueSlot {
            checksum: key_checksum(key),
            value: key * 10,
        };
        for index in probe_sequence(key, 2, 1024) {
            kv_peer
                .write_slot(&kv_meta, index, KeyValueSlot::SIZE, &slot.to_words()[..KeyValueSlot::WORDS])
                .unwrap();
        }
    }

    // Postcard writer
    for i in 0..10u64 {
        let hops = [i as u32 + 1, 2, 3, 4, 5];
        postcard_peer
            .write_slot(&postcard_meta, i, PostcardSlot::SIZE, &PostcardSlot::with_hops(hops).to_words())
            .unwrap();
    }

    // Append writers, each producing its own sequence
    for (offset, (_, peer, metadata)) in list_peers.iter().enumerate() {
        for i in 0..5u32 {
            let value = (offset as u32 + 1) * 100 + i;
            peer.write_slot(metadata, u64::from(i), AppendSlot::SIZE, &[value]).unwrap();
        }
    }

    for key in 1..=16u32 {
        assert_eq!(keyvalue.query(key, 2).unwrap(), key * 10);
    }
    assert_eq!(postcard.analyze().unwrap().occupied, 10);
    assert_eq!(postcard.record(9).unwrap().hops[0], 10);

    for (list, _, _) in &list_peers {
        assert_eq!(list.analyze().unwrap().occupied, 5);
        // One gap: the first entry does not follow 0
        assert_eq!(list.find_sequence_gaps().unwrap().len(), 1);
        assert!(list.rdma_info().unwrap().psn_drift >= 5);
    }
}

#[test]
fn test_stores_are_shared_across_reader_threads() {
    let (fabric, shared) = fabric();
    let store = Arc::new(HashKeyValueStore::new(common::config("shared", 2000, 256), shared).unwrap());
    let (peer, metadata) = common::connect(&fabric, &store);

    let slot = KeyValueSlot {
        checksum: key_checksum(3),
        value: 33,
    };
    for index in probe_sequence(3, 1, 256) {
        common::write(&peer, &metadata, index, &slot);
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.query(3, 1).unwrap())
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.join().unwrap(), 33);
    }
}

#[test]
fn test_stores_stay_independent_when_one_fails() {
    let (fabric, shared) = fabric();
    let quick = StoreConfig::builder()
        .name("abandoned")
        .port(2100)
        .capacity(64)
        .standard_pages()
        .event_timeout(Duration::from_millis(100))
        .build();
    let abandoned = Arc::new(CircularAppendLog::new(quick, Arc::clone(&shared)).unwrap());
    let served = Arc::new(CircularAppendLog::new(common::config("served", 2101, 64), shared).unwrap());

    let failing = Arc::clone(&abandoned).spawn_initiate().unwrap();
    let (_peer, _metadata) = common::connect(&fabric, &served);

    assert!(failing.join().unwrap().is_err());
    assert!(!abandoned.is_ready());
    assert!(served.is_ready());
    assert!(served.analyze().is_ok());
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_config_defaults() {
    let config = StoreConfig::default();

    assert_eq!(config.port, 1337);
    assert_eq!(config.page_policy, PagePolicy::HugePages { page_size: HUGE_PAGE_SIZE });
    assert_eq!(config.session.event_timeout, None);
    assert_eq!(config.session.advertise_ack_timeout, Duration::from_secs(2));
}

#[test]
fn test_config_builder() {
    let config = StoreConfig::builder()
        .name("built")
        .port(4242)
        .capacity(512)
        .standard_pages()
        .progress_interval(10)
        .event_timeout(Duration::from_secs(1))
        .advertise_settle(Duration::from_millis(5))
        .build();

    assert_eq!(config.name, "built");
    assert_eq!(config.port, 4242);
    assert_eq!(config.capacity, 512);
    assert_eq!(config.page_policy.page_size(), STANDARD_PAGE_SIZE);
    assert_eq!(config.progress_interval, 10);
    assert_eq!(config.session.event_timeout, Some(Duration::from_secs(1)));
    assert_eq!(config.session.advertise_settle, Duration::from_millis(5));
}
