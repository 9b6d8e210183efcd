//! Collector Binary
//!
//! Starts a key/value store, a postcard store and a set of append logs on
//! consecutive ports, initiates each on its own thread, and prints
//! diagnostics for the ready ones every time ENTER is pressed.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use dta_collector::store::{key_checksum, probe_index, AppendSlot, KeyValueSlot, PostcardSlot, Slot};
use dta_collector::{
    AddressableSlotStore, CircularAppendLog, Fabric, HashKeyValueStore, LoopbackFabric,
    MultiHopRecordStore, PagePolicy, Result, StoreConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

/// DTA Collector
#[derive(Parser, Debug)]
#[command(name = "dta-collector")]
#[command(about = "Collector exposing one-sided writable slot stores")]
#[command(version)]
struct Args {
    /// Key/value store slot count (power of two)
    #[arg(long, default_value = "256")]
    keyvalue_slots: u64,

    /// Key/value store port
    #[arg(long, default_value = "1337")]
    keyvalue_port: u16,

    /// Postcard store slot count (power of two)
    #[arg(long, default_value = "256")]
    postcard_slots: u64,

    /// Postcard store port
    #[arg(long, default_value = "1336")]
    postcard_port: u16,

    /// Number of append logs
    #[arg(short, long, default_value = "4")]
    lists: u16,

    /// Port of the first append log; the others follow consecutively
    #[arg(long, default_value = "1338")]
    list_port_start: u16,

    /// Slot count of each append log (power of two)
    #[arg(long, default_value = "256")]
    list_slots: u64,

    /// Back storage with ordinary pages instead of 1 GiB huge pages
    #[arg(long)]
    standard_pages: bool,

    /// Give up waiting for a peer after this many seconds (waits forever by default)
    #[arg(long)]
    event_timeout_secs: Option<u64>,

    /// Redundancy used by key/value queries and synthetic writers
    #[arg(short, long, default_value = "4")]
    redundancy: u8,

    /// Attach in-process peers that write synthetic reports
    #[arg(long)]
    synthetic: bool,

    /// Entries each synthetic peer writes
    #[arg(long, default_value = "64")]
    synthetic_entries: u32,

    /// Maximum number of slots printed per store
    #[arg(long, default_value = "32")]
    print_limit: usize,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dta_collector=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("DTA Collector v{}", dta_collector::VERSION);

    let fabric = LoopbackFabric::new();
    let stores = match Stores::build(&args, Arc::new(fabric.clone())) {
        Ok(stores) => stores,
        Err(e) => {
            tracing::error!("Failed to construct stores: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = stores.initiate_all() {
        tracing::error!("Failed to start initiation threads: {}", e);
        std::process::exit(1);
    }

    if args.synthetic {
        spawn_synthetic_peers(&args, &fabric, &stores);
    }

    println!("Press ENTER to analyze storage. This MIGHT impact RDMA performance, so avoid during benchmarking!");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() {
            break;
        }
        stores.report(&args);
    }

    tracing::info!("Collector stopping");
}

struct Stores {
    keyvalue: Arc<HashKeyValueStore>,
    postcard: Arc<MultiHopRecordStore>,
    lists: Vec<Arc<CircularAppendLog>>,
}

impl Stores {
    fn build(args: &Args, fabric: Arc<dyn Fabric>) -> Result<Self> {
        let base = |name: String, port: u16, capacity: u64| {
            let mut builder = StoreConfig::builder().name(name).port(port).capacity(capacity);
            if let Some(secs) = args.event_timeout_secs {
                builder = builder.event_timeout(Duration::from_secs(secs));
            }
            if args.standard_pages {
                builder.page_policy(PagePolicy::Standard).build()
            } else {
                builder.build()
            }
        };

        let keyvalue = HashKeyValueStore::new(
            base("KeyWriteStore".to_string(), args.keyvalue_port, args.keyvalue_slots),
            Arc::clone(&fabric),
        )?;
        let postcard = MultiHopRecordStore::new(
            base("PostcarderStore".to_string(), args.postcard_port, args.postcard_slots),
            Arc::clone(&fabric),
        )?;

        let mut lists = Vec::with_capacity(args.lists as usize);
        for i in 0..args.lists {
            let config = base(format!("List{}", i), args.list_port_start + i, args.list_slots);
            lists.push(Arc::new(CircularAppendLog::new(config, Arc::clone(&fabric))?));
        }

        Ok(Self {
            keyvalue: Arc::new(keyvalue),
            postcard: Arc::new(postcard),
            lists,
        })
    }

    /// Initiate every store on its own thread; failures are logged there
    fn initiate_all(&self) -> Result<()> {
        Arc::clone(&self.keyvalue).spawn_initiate()?;
        Arc::clone(&self.postcard).spawn_initiate()?;
        for list in &self.lists {
            Arc::clone(list).spawn_initiate()?;
        }
        Ok(())
    }

    fn report(&self, args: &Args) {
        for list in &self.lists {
            if report_store(list.as_ref(), args.print_limit, print_append) {
                if let Ok(gaps) = list.find_empty_spans(true) {
                    println!("Empty spans: {:?}", gaps);
                }
            }
        }

        report_store(self.postcard.as_ref(), args.print_limit, print_postcard);

        if report_store(self.keyvalue.as_ref(), args.print_limit, print_keyvalue) {
            match self.keyvalue.query(1, args.redundancy) {
                Ok(value) => println!("Query result for key 1: {}", value),
                Err(e) => tracing::warn!("Query failed: {}", e),
            }
        }
    }
}

/// Print info, slots, analysis and one completion; false if not ready
fn report_store<S: AddressableSlotStore>(store: &S, limit: usize, print: fn(u64, &S::Slot)) -> bool {
    if !store.is_ready() {
        println!("{} is not ready yet, skipping.", store.name());
        return false;
    }

    match store.rdma_info() {
        Ok(info) => println!(
            "'{}': QP {} lkey {} rkey {} rq_psn {} (diff {} from initial PSN)",
            store.name(),
            info.qp_num,
            info.lkey,
            info.rkey,
            info.rq_psn,
            info.psn_drift
        ),
        Err(e) => tracing::warn!("No transport info for '{}': {}", store.name(), e),
    }

    if let Ok(slots) = store.snapshot(0, limit) {
        println!("Storage of '{}':", store.name());
        for (index, slot) in (0u64..).zip(slots.iter()) {
            print(index, slot);
        }
    }

    if let Ok(analysis) = store.analyze() {
        println!(
            "Memory slots in use: {} / {} (load factor {:.2}%)",
            analysis.occupied,
            analysis.capacity,
            analysis.load_factor_percent()
        );
    }

    match store.poll_completion() {
        Ok(poll) => println!("Completion queue: {:?}", poll),
        Err(e) => tracing::warn!("Completion poll failed for '{}': {}", store.name(), e),
    }
    true
}

fn print_keyvalue(index: u64, slot: &KeyValueSlot) {
    println!("{:>5}: ({:010},{:010})", index, slot.checksum, slot.value);
}

fn print_postcard(index: u64, slot: &PostcardSlot) {
    let hops: Vec<String> = slot.hops.iter().map(|h| format!("{:010}", h)).collect();
    println!("{:>5}: ({})", index, hops.join(","));
}

fn print_append(index: u64, slot: &AppendSlot) {
    println!("{:>5}: ({:010})", index, slot.value);
}

// =============================================================================
// Synthetic Peers
// =============================================================================

const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to a store and write through `write` as soon as the metadata arrives
fn spawn_peer<S, F>(fabric: &LoopbackFabric, store: Arc<S>, write: F)
where
    S: AddressableSlotStore + 'static,
    F: FnOnce(&dta_collector::RemotePeer, &dta_collector::transport::RegionMetadata) -> Result<()>
        + Send
        + 'static,
{
    let fabric = fabric.clone();
    thread::spawn(move || {
        let run = || -> Result<()> {
            let peer = fabric.connect_timeout(store.port(), PEER_TIMEOUT)?;
            let metadata = peer.recv_metadata(PEER_TIMEOUT)?;
            write(&peer, &metadata)?;
            tracing::info!("Synthetic peer finished writing to '{}'", store.name());
            // Keep the connection open for the life of the process
            loop {
                thread::park();
            }
        };
        if let Err(e) = run() {
            tracing::warn!("Synthetic peer for '{}' failed: {}", store.name(), e);
        }
    });
}

fn spawn_synthetic_peers(args: &Args, fabric: &LoopbackFabric, stores: &Stores) {
    let entries = args.synthetic_entries;
    let redundancy = args.redundancy;

    let capacity = stores.keyvalue.capacity();
    spawn_peer(fabric, Arc::clone(&stores.keyvalue), move |peer, metadata| {
        for key in 1..=entries {
            let slot = KeyValueSlot {
                checksum: key_checksum(key),
                value: key * 10,
            };
            for n in 0..redundancy {
                let index = probe_index(key, n, capacity);
                peer.write_slot(metadata, index, KeyValueSlot::SIZE, &slot.to_words()[..KeyValueSlot::WORDS])?;
            }
        }
        Ok(())
    });

    let capacity = stores.postcard.capacity();
    spawn_peer(fabric, Arc::clone(&stores.postcard), move |peer, metadata| {
        for i in 0..u64::from(entries).min(capacity) {
            let base = i as u32 * 5;
            let slot = PostcardSlot::with_hops([base + 1, base + 2, base + 3, base + 4, base + 5]);
            peer.write_slot(metadata, i, PostcardSlot::SIZE, &slot.to_words())?;
        }
        Ok(())
    });

    for list in &stores.lists {
        let capacity = list.capacity();
        spawn_peer(fabric, Arc::clone(list), move |peer, metadata| {
            for value in 1..=entries {
                let index = u64::from(value - 1) % capacity;
                peer.write_slot(metadata, index, AppendSlot::SIZE, &[value])?;
            }
            Ok(())
        });
    }
}
