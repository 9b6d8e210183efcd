//! Shared helpers for store tests
//!
//! Every test builds its own `LoopbackFabric`, so ports only need to be
//! unique within one test.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dta_collector::store::Slot;
use dta_collector::transport::RegionMetadata;
use dta_collector::{AddressableSlotStore, LoopbackFabric, RemotePeer, Result, StoreConfig};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Small store on ordinary pages that gives up waiting after `TIMEOUT`
pub fn config(name: &str, port: u16, capacity: u64) -> StoreConfig {
    StoreConfig::builder()
        .name(name)
        .port(port)
        .capacity(capacity)
        .standard_pages()
        .event_timeout(TIMEOUT)
        .build()
}

pub fn fabric() -> (LoopbackFabric, Arc<dyn dta_collector::Fabric>) {
    let fabric = LoopbackFabric::new();
    let shared: Arc<dyn dta_collector::Fabric> = Arc::new(fabric.clone());
    (fabric, shared)
}

/// Start initiating `store` and return as soon as the peer holds the metadata
///
/// The store may still be finishing its setup; join the handle to wait.
pub fn attach<S: AddressableSlotStore + 'static>(
    fabric: &LoopbackFabric,
    store: &Arc<S>,
) -> (JoinHandle<Result<()>>, RemotePeer, RegionMetadata) {
    let handle = Arc::clone(store).spawn_initiate().unwrap();
    let peer = fabric.connect_timeout(store.port(), TIMEOUT).unwrap();
    let metadata = peer.recv_metadata(TIMEOUT).unwrap();
    (handle, peer, metadata)
}

/// Initiate `store` against a fresh peer and wait until it is ready
///
/// The returned peer must be kept alive for as long as the connection is
/// needed.
pub fn connect<S: AddressableSlotStore + 'static>(
    fabric: &LoopbackFabric,
    store: &Arc<S>,
) -> (RemotePeer, RegionMetadata) {
    let (handle, peer, metadata) = attach(fabric, store);
    handle.join().unwrap().unwrap();
    assert!(store.is_ready());
    (peer, metadata)
}

/// Write one slot the way a remote writer would
pub fn write<S: Slot>(peer: &RemotePeer, metadata: &RegionMetadata, index: u64, slot: &S) {
    peer.write_slot(metadata, index, S::SIZE, &slot.to_words()[..S::WORDS])
        .unwrap();
}
