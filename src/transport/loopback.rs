//! Loopback Fabric
//!
//! In-process fabric with the same contract as a verbs/connection-manager
//! stack, plus the peer side that performs one-sided accesses.
//!
//! ## Behaviour
//! - Ports are bound per event channel and released when it is dropped
//! - A region gets one key, valid as both lkey and rkey
//! - Every accepted one-sided write advances the server's receive PSN by one
//! - Access violations fail on the peer and post a `RemoteAccessError`
//!   completion on the server's queue

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::QueuePairConfig;
use crate::error::{CollectorError, Result};

use super::{
    AccessFlags, CmEvent, CmEventKind, ConnectionId, Endpoint, EventChannel, Fabric,
    RegionKeys, RegionMetadata, ScatterGather, WcOpcode, WcStatus, WorkCompletion, PSN_MASK,
};

/// How often `connect_timeout` retries while the server is not listening yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// In-process fabric shared by servers and peers
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

#[derive(Default)]
struct FabricInner {
    listeners: Mutex<HashMap<u16, Listener>>,
    pending: Mutex<HashMap<ConnectionId, Arc<Link>>>,
    next_id: AtomicU64,
}

struct Listener {
    channel_id: u64,
    events: Sender<CmEvent>,
    listening: bool,
}

/// State shared by one server endpoint and its peer
struct Link {
    id: ConnectionId,
    channel_id: u64,
    qp_num: u32,
    regions: Mutex<Vec<Registration>>,
    completions: Mutex<VecDeque<WorkCompletion>>,
    cq_size: AtomicU32,
    to_peer: Sender<Bytes>,
    peer_inbox: Receiver<Bytes>,
    rq_psn: AtomicU32,
    server_events: Mutex<Option<Sender<CmEvent>>>,
    server_closed: AtomicBool,
    peer_closed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    addr: usize,
    length: usize,
    key: u32,
    access: AccessFlags,
}

impl Registration {
    /// Start of `[addr, addr + len)` as a pointer if it lies inside this region
    fn resolve(&self, addr: u64, len: usize) -> Option<*const AtomicU32> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        if start < self.addr || end > self.addr + self.length || start % 4 != 0 {
            return None;
        }
        Some(start as *const AtomicU32)
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a listening port (the peer side of `listen_and_accept`)
    pub fn connect(&self, port: u16) -> Result<RemotePeer> {
        let listeners = self.inner.listeners.lock();
        let listener = listeners
            .get(&port)
            .filter(|l| l.listening)
            .ok_or_else(|| {
                CollectorError::Transport(format!("Connection refused on port {}", port))
            })?;

        let id = self.inner.next_id();
        let qp_num = self.inner.next_id() as u32;
        let (to_peer, peer_inbox) = channel::unbounded();

        let link = Arc::new(Link {
            id,
            channel_id: listener.channel_id,
            qp_num,
            regions: Mutex::new(Vec::new()),
            completions: Mutex::new(VecDeque::new()),
            cq_size: AtomicU32::new(0),
            to_peer,
            peer_inbox,
            rq_psn: AtomicU32::new(qp_num.wrapping_mul(7919) & PSN_MASK),
            server_events: Mutex::new(None),
            server_closed: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
        });

        self.inner.pending.lock().insert(id, Arc::clone(&link));
        listener
            .events
            .send(CmEvent {
                kind: CmEventKind::ConnectRequest,
                id,
                status: 0,
            })
            .map_err(|_| CollectorError::Transport(format!("Listener on port {} is gone", port)))?;

        tracing::debug!("Peer requested connection {} on port {}", id, port);
        Ok(RemotePeer { link })
    }

    /// Keep trying to connect until the port listens or `timeout` passes
    pub fn connect_timeout(&self, port: u16, timeout: Duration) -> Result<RemotePeer> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.connect(port) {
                Ok(peer) => return Ok(peer),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => thread::sleep(CONNECT_RETRY_INTERVAL),
            }
        }
    }

    /// Deliver an arbitrary event to the channel listening on `port`
    ///
    /// Fault injection for exercising the session's event handling.
    pub fn inject_event(&self, port: u16, kind: CmEventKind, status: i32) -> Result<()> {
        let listeners = self.inner.listeners.lock();
        let listener = listeners.get(&port).ok_or_else(|| {
            CollectorError::Transport(format!("No channel bound to port {}", port))
        })?;
        listener
            .events
            .send(CmEvent { kind, id: 0, status })
            .map_err(|_| CollectorError::Transport(format!("Listener on port {} is gone", port)))
    }

    /// Whether some channel currently holds `port`
    pub fn is_bound(&self, port: u16) -> bool {
        self.inner.listeners.lock().contains_key(&port)
    }
}

impl FabricInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Fabric for LoopbackFabric {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create_event_channel(&self) -> Result<Box<dyn EventChannel>> {
        let (events_tx, events_rx) = channel::unbounded();
        Ok(Box::new(LoopbackChannel {
            inner: Arc::clone(&self.inner),
            channel_id: self.inner.next_id(),
            events_tx,
            events_rx,
            port: None,
        }))
    }
}

// =============================================================================
// Server Side
// =============================================================================

struct LoopbackChannel {
    inner: Arc<FabricInner>,
    channel_id: u64,
    events_tx: Sender<CmEvent>,
    events_rx: Receiver<CmEvent>,
    port: Option<u16>,
}

impl EventChannel for LoopbackChannel {
    fn bind(&mut self, port: u16) -> Result<()> {
        if self.port.is_some() {
            return Err(CollectorError::Transport("Channel is already bound".to_string()));
        }

        let mut listeners = self.inner.listeners.lock();
        if listeners.contains_key(&port) {
            return Err(CollectorError::AddressInUse(port));
        }
        listeners.insert(
            port,
            Listener {
                channel_id: self.channel_id,
                events: self.events_tx.clone(),
                listening: false,
            },
        );
        self.port = Some(port);
        Ok(())
    }

    fn listen(&mut self, _backlog: u32) -> Result<()> {
        let port = self
            .port
            .ok_or_else(|| CollectorError::Transport("Listen before bind".to_string()))?;
        let mut listeners = self.inner.listeners.lock();
        match listeners.get_mut(&port) {
            Some(listener) if listener.channel_id == self.channel_id => {
                listener.listening = true;
                Ok(())
            }
            _ => Err(CollectorError::Transport(format!("Port {} is not bound by this channel", port))),
        }
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<CmEvent>> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CollectorError::Transport("Event channel closed".to_string()))
            }
        }
    }

    fn accept(&mut self, id: ConnectionId, qp: &QueuePairConfig) -> Result<Box<dyn Endpoint>> {
        let link = self.inner.pending.lock().remove(&id).ok_or_else(|| {
            CollectorError::Transport(format!("No pending connection with id {}", id))
        })?;

        if link.peer_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::Transport(format!(
                "Peer of connection {} went away before accept",
                id
            )));
        }

        link.cq_size.store(qp.cq_size, Ordering::Relaxed);
        *link.server_events.lock() = Some(self.events_tx.clone());

        self.events_tx
            .send(CmEvent {
                kind: CmEventKind::Established,
                id,
                status: 0,
            })
            .map_err(|_| CollectorError::Transport("Event channel closed".to_string()))?;

        Ok(Box::new(LoopbackEndpoint {
            inner: Arc::clone(&self.inner),
            link,
        }))
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        if let Some(port) = self.port {
            let mut listeners = self.inner.listeners.lock();
            if listeners.get(&port).map(|l| l.channel_id) == Some(self.channel_id) {
                listeners.remove(&port);
            }
        }
        let channel_id = self.channel_id;
        self.inner
            .pending
            .lock()
            .retain(|_, link| link.channel_id != channel_id);
    }
}

struct LoopbackEndpoint {
    inner: Arc<FabricInner>,
    link: Arc<Link>,
}

impl LoopbackEndpoint {
    fn complete(&self, wr_id: u64, status: WcStatus) {
        self.link.push_completion(WorkCompletion {
            wr_id,
            status,
            opcode: WcOpcode::Send,
        });
    }
}

impl Endpoint for LoopbackEndpoint {
    fn qp_num(&self) -> u32 {
        self.link.qp_num
    }

    unsafe fn register_region(
        &mut self,
        addr: NonNull<u8>,
        length: usize,
        access: AccessFlags,
    ) -> Result<RegionKeys> {
        if self.link.server_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::Transport("Endpoint is disconnected".to_string()));
        }
        let addr = addr.as_ptr() as usize;
        if addr % 4 != 0 {
            return Err(CollectorError::Transport(format!(
                "Region at {:#x} is not word aligned",
                addr
            )));
        }

        let key = self.inner.next_id() as u32;
        self.link.regions.lock().push(Registration {
            addr,
            length,
            key,
            access,
        });
        Ok(RegionKeys { lkey: key, rkey: key })
    }

    fn deregister_region(&mut self, keys: RegionKeys) -> Result<()> {
        let mut regions = self.link.regions.lock();
        let before = regions.len();
        regions.retain(|r| r.key != keys.rkey);
        if regions.len() == before {
            return Err(CollectorError::Transport(format!(
                "No region registered with key {}",
                keys.rkey
            )));
        }
        Ok(())
    }

    fn post_send(&mut self, wr_id: u64, sge: ScatterGather, signaled: bool) -> Result<()> {
        if self.link.server_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::Transport("Endpoint is disconnected".to_string()));
        }

        let length = sge.length as usize;
        let payload = {
            let regions = self.link.regions.lock();
            let source = regions
                .iter()
                .filter(|r| r.key == sge.lkey)
                .find_map(|r| r.resolve(sge.addr, length));

            match source {
                Some(ptr) if length % 4 == 0 => {
                    // SAFETY: resolve() checked the range against a live
                    // registration, which the lock keeps alive.
                    let words = unsafe { std::slice::from_raw_parts(ptr, length / 4) };
                    let mut bytes = Vec::with_capacity(length);
                    for word in words {
                        bytes.extend_from_slice(&word.load(Ordering::Acquire).to_ne_bytes());
                    }
                    Some(Bytes::from(bytes))
                }
                _ => None,
            }
        };

        let status = match payload {
            None => WcStatus::LocalProtectionError,
            Some(_) if self.link.peer_closed.load(Ordering::SeqCst) => WcStatus::RetryExceeded,
            Some(bytes) => match self.link.to_peer.send(bytes) {
                Ok(()) => WcStatus::Success,
                Err(_) => WcStatus::RetryExceeded,
            },
        };

        if signaled || status != WcStatus::Success {
            self.complete(wr_id, status);
        }
        Ok(())
    }

    fn poll_completion(&mut self) -> Result<Option<WorkCompletion>> {
        Ok(self.link.completions.lock().pop_front())
    }

    fn receive_psn(&self) -> Result<u32> {
        Ok(self.link.rq_psn.load(Ordering::Acquire))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.link.close_server();
        Ok(())
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.link.close_server();
    }
}

impl Link {
    fn push_completion(&self, wc: WorkCompletion) {
        let mut completions = self.completions.lock();
        let cq_size = self.cq_size.load(Ordering::Relaxed) as usize;
        if cq_size > 0 && completions.len() >= cq_size {
            tracing::warn!("Completion queue of connection {} overran, dropping {:?}", self.id, wc);
            return;
        }
        completions.push_back(wc);
    }

    /// Tear down the server half: no region stays reachable afterwards
    fn close_server(&self) {
        self.server_closed.store(true, Ordering::SeqCst);
        self.regions.lock().clear();
    }
}

// =============================================================================
// Peer Side
// =============================================================================

/// The remote end of a loopback connection
///
/// Plays the translator: it receives the advertisement and then reads and
/// writes the server's region directly.
pub struct RemotePeer {
    link: Arc<Link>,
}

impl RemotePeer {
    pub fn connection_id(&self) -> ConnectionId {
        self.link.id
    }

    /// Receive the next SEND from the server
    pub fn recv(&self, timeout: Duration) -> Result<Bytes> {
        self.link.peer_inbox.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                CollectorError::Timeout(format!("no message from server within {:?}", timeout))
            }
            RecvTimeoutError::Disconnected => {
                CollectorError::Transport("Server side is gone".to_string())
            }
        })
    }

    /// Receive and decode the region advertisement
    pub fn recv_metadata(&self, timeout: Duration) -> Result<RegionMetadata> {
        let payload = self.recv(timeout)?;
        RegionMetadata::decode(&payload)
    }

    /// One-sided write of `words` at `remote_addr`
    pub fn write_words(&self, remote_addr: u64, rkey: u32, words: &[u32]) -> Result<()> {
        self.post_write(0, remote_addr, rkey, words)
    }

    /// One-sided write tagged with a work request id
    pub fn post_write(&self, wr_id: u64, remote_addr: u64, rkey: u32, words: &[u32]) -> Result<()> {
        let regions = self.link.regions.lock();
        let target = self.target(&regions, remote_addr, rkey, words.len(), |a| a.remote_write);

        let ptr = match target {
            Ok(ptr) => ptr,
            Err(e) => {
                drop(regions);
                self.link.push_completion(WorkCompletion {
                    wr_id,
                    status: WcStatus::RemoteAccessError,
                    opcode: WcOpcode::RdmaWrite,
                });
                return Err(e);
            }
        };

        // SAFETY: the range was validated against a live registration and
        // the regions lock keeps it registered while we write.
        let slots = unsafe { std::slice::from_raw_parts(ptr, words.len()) };
        for (slot, word) in slots.iter().zip(words) {
            slot.store(*word, Ordering::Release);
        }
        drop(regions);

        let _ = self
            .link
            .rq_psn
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |psn| {
                Some(psn.wrapping_add(1) & PSN_MASK)
            });
        Ok(())
    }

    /// One-sided read of `count` words at `remote_addr`
    pub fn read_words(&self, remote_addr: u64, rkey: u32, count: usize) -> Result<Vec<u32>> {
        let regions = self.link.regions.lock();
        let ptr = self.target(&regions, remote_addr, rkey, count, |a| a.remote_read)?;

        // SAFETY: as in post_write.
        let slots = unsafe { std::slice::from_raw_parts(ptr, count) };
        Ok(slots.iter().map(|w| w.load(Ordering::Acquire)).collect())
    }

    /// Write one slot addressed the way the translator does: `index * slot_size`
    pub fn write_slot(
        &self,
        metadata: &RegionMetadata,
        index: u64,
        slot_size: usize,
        words: &[u32],
    ) -> Result<()> {
        self.write_words(metadata.slot_addr(index, slot_size), metadata.key, words)
    }

    /// Read one slot addressed by `index * slot_size`
    pub fn read_slot(
        &self,
        metadata: &RegionMetadata,
        index: u64,
        slot_size: usize,
    ) -> Result<Vec<u32>> {
        self.read_words(metadata.slot_addr(index, slot_size), metadata.key, slot_size / 4)
    }

    /// Close the connection; the server sees a `Disconnected` event
    pub fn disconnect(&self) {
        if self.link.peer_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = self.link.server_events.lock().as_ref() {
            let _ = events.send(CmEvent {
                kind: CmEventKind::Disconnected,
                id: self.link.id,
                status: 0,
            });
        }
    }

    fn target(
        &self,
        regions: &[Registration],
        remote_addr: u64,
        rkey: u32,
        words: usize,
        allowed: impl Fn(&AccessFlags) -> bool,
    ) -> Result<*const AtomicU32> {
        if self.link.server_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::RemoteAccess("Connection is closed".to_string()));
        }

        let region = regions
            .iter()
            .find(|r| r.key == rkey)
            .ok_or_else(|| CollectorError::RemoteAccess(format!("Unknown rkey {}", rkey)))?;

        if !allowed(&region.access) {
            return Err(CollectorError::RemoteAccess(format!(
                "Region {} does not grant this access",
                rkey
            )));
        }

        region.resolve(remote_addr, words * 4).ok_or_else(|| {
            CollectorError::RemoteAccess(format!(
                "{} words at {:#x} fall outside region {} or are misaligned",
                words, remote_addr, rkey
            ))
        })
    }
}

impl Drop for RemotePeer {
    fn drop(&mut self) {
        self.disconnect();
    }
}
