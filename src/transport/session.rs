//! Transport Session
//!
//! Drives one fabric endpoint from listen to ready and owns everything it
//! acquired on the way.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::error::{CollectorError, Result};
use crate::memory::PinnedBuffer;

use super::{
    AccessFlags, CancelToken, CmEvent, CmEventKind, CompletionPoll, Endpoint, EventChannel,
    Fabric, MemoryRegion, RegionMetadata, ScatterGather, WcStatus, METADATA_LEN, PSN_MASK,
};

/// Work request id of the metadata SEND
const ADVERTISE_WR_ID: u64 = 1;

/// Completion polling cadence while waiting for the advertisement ack
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle of a session; transitions are strictly sequential
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Unbound,
    Listening,
    ConnectRequestReceived,
    Accepted,
    RegionRegistered,
    MetadataAdvertised,
    Ready,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unbound => "Unbound",
            SessionState::Listening => "Listening",
            SessionState::ConnectRequestReceived => "ConnectRequestReceived",
            SessionState::Accepted => "Accepted",
            SessionState::RegionRegistered => "RegionRegistered",
            SessionState::MetadataAdvertised => "MetadataAdvertised",
            SessionState::Ready => "Ready",
        }
    }
}

/// Transport details reported by diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaInfo {
    pub qp_num: u32,
    pub lkey: u32,
    pub rkey: u32,
    pub rq_psn: u32,
    pub initial_psn: u32,
    /// Packets received since the baseline (24-bit wrap-around)
    pub psn_drift: u32,
}

/// One connection-manager endpoint with its registered region
///
/// ## Ownership
/// The session owns the event channel, the endpoint, the registration and
/// a handle on the registered buffer. Dropping it deregisters the region
/// before the buffer handle is released, then disconnects.
pub struct TransportSession {
    name: String,
    port: Option<u16>,
    config: SessionConfig,
    state: SessionState,
    cancel: CancelToken,

    fabric: Arc<dyn Fabric>,
    channel: Option<Box<dyn EventChannel>>,
    endpoint: Option<Box<dyn Endpoint>>,

    region: Option<MemoryRegion>,
    buffer: Option<Arc<PinnedBuffer>>,

    initial_psn: Option<u32>,
}

impl TransportSession {
    /// Create an unbound session
    pub fn new(name: impl Into<String>, fabric: Arc<dyn Fabric>, config: SessionConfig) -> Self {
        Self {
            name: name.into(),
            port: None,
            config,
            state: SessionState::Unbound,
            cancel: CancelToken::new(),
            fabric,
            channel: None,
            endpoint: None,
            region: None,
            buffer: None,
            initial_psn: None,
        }
    }

    /// Use an externally controlled cancellation token
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    /// Bind, listen and accept exactly one peer (blocking)
    ///
    /// Steps:
    /// 1. Create the event channel, bind to `port`, listen
    /// 2. Wait for a connect request
    /// 3. Create the queue pair and accept
    /// 4. Wait for the connection to be established
    pub fn listen_and_accept(&mut self, port: u16) -> Result<()> {
        self.expect_state(SessionState::Unbound)?;

        tracing::info!("Listening for connections to '{}' on port {} ({})", self.name, port, self.fabric.name());

        let mut channel = self.fabric.create_event_channel()?;
        channel.bind(port)?;
        channel.listen(self.config.listen_backlog)?;
        self.channel = Some(channel);
        self.port = Some(port);
        self.state = SessionState::Listening;

        tracing::debug!("Waiting for connect request for '{}'", self.name);
        let request = self.wait_for_event(CmEventKind::ConnectRequest)?;
        self.state = SessionState::ConnectRequestReceived;

        tracing::debug!("Accepting connection {} for '{}'", request.id, self.name);
        let qp = self.config.queue_pair;
        let endpoint = self.channel_mut()?.accept(request.id, &qp)?;
        tracing::debug!("Queue pair {} created for '{}'", endpoint.qp_num(), self.name);
        self.endpoint = Some(endpoint);

        self.wait_for_event(CmEventKind::Established)?;
        self.state = SessionState::Accepted;

        tracing::info!("Connection established for '{}'", self.name);
        Ok(())
    }

    /// Register the whole buffer for local write and remote read/write/atomic
    pub fn register_region(&mut self, buffer: Arc<PinnedBuffer>) -> Result<MemoryRegion> {
        self.expect_state(SessionState::Accepted)?;

        tracing::info!(
            "Registering memory region {:p} of {} bytes for '{}'",
            buffer.as_ptr().as_ptr(),
            buffer.len(),
            self.name
        );

        let endpoint = self.endpoint_mut()?;
        // SAFETY: the buffer is page aligned, accessed only through atomics,
        // and the session keeps its Arc until after deregistration in Drop.
        let keys = unsafe {
            endpoint.register_region(buffer.as_ptr(), buffer.len(), AccessFlags::FULL_REMOTE)?
        };

        let region = MemoryRegion {
            addr: buffer.addr(),
            length: buffer.len(),
            lkey: keys.lkey,
            rkey: keys.rkey,
        };

        tracing::debug!("Registered region for '{}': {:?}", self.name, region);

        self.region = Some(region);
        self.buffer = Some(buffer);
        self.state = SessionState::RegionRegistered;
        Ok(region)
    }

    /// Tell the peer where the region is
    ///
    /// The metadata words are written into the front of the region itself,
    /// sent as one signaled SEND, and zeroed again once the send completed.
    /// On a reliable connection the completion is only generated after the
    /// peer acknowledged the message, so no fixed sleep is needed.
    pub fn advertise_metadata(&mut self) -> Result<RegionMetadata> {
        self.expect_state(SessionState::RegionRegistered)?;

        let region = self.region.ok_or(CollectorError::InvalidState {
            expected: "RegionRegistered",
            actual: "no region",
        })?;
        let buffer = self.buffer.clone().ok_or(CollectorError::InvalidState {
            expected: "RegionRegistered",
            actual: "no buffer",
        })?;

        if buffer.len() < METADATA_LEN {
            return Err(CollectorError::Config(format!(
                "Region of {} bytes cannot carry {} bytes of metadata",
                buffer.len(),
                METADATA_LEN
            )));
        }

        let length = u32::try_from(region.length).unwrap_or_else(|_| {
            tracing::warn!(
                "Region length {} of '{}' does not fit 32 bits, advertising {}",
                region.length,
                self.name,
                region.length as u32
            );
            region.length as u32
        });

        let metadata = RegionMetadata {
            addr: region.addr,
            length,
            key: region.lkey,
        };

        let words = buffer.words();
        for (slot, word) in words.iter().zip(metadata.to_words()) {
            slot.store(word, Ordering::Relaxed);
        }
        fence(Ordering::Release);

        tracing::info!(
            "Advertising addr: {:#x} len: {} lkey: {} to peer of '{}'",
            metadata.addr,
            metadata.length,
            metadata.key,
            self.name
        );

        let sge = ScatterGather {
            addr: region.addr,
            length: METADATA_LEN as u32,
            lkey: region.lkey,
        };
        let outcome = self
            .endpoint_mut()
            .and_then(|endpoint| endpoint.post_send(ADVERTISE_WR_ID, sge, true))
            .and_then(|()| self.wait_for_completion(ADVERTISE_WR_ID));

        // Stale metadata must never look like slot data. Cleared before the
        // settle delay so writes landing during it are kept.
        for slot in words.iter().take(METADATA_LEN / 4) {
            slot.store(0, Ordering::Relaxed);
        }

        if outcome.is_ok() && !self.config.advertise_settle.is_zero() {
            thread::sleep(self.config.advertise_settle);
        }

        outcome?;
        self.state = SessionState::MetadataAdvertised;
        Ok(metadata)
    }

    /// Record the receive PSN right after advertisement
    pub fn capture_initial_sequence_number(&mut self) -> Result<u32> {
        self.expect_state(SessionState::MetadataAdvertised)?;

        let psn = self.endpoint_ref()?.receive_psn()? & PSN_MASK;
        tracing::info!("Initial PSN for '{}' is {}", self.name, psn);

        self.initial_psn = Some(psn);
        self.state = SessionState::Ready;
        Ok(psn)
    }

    // =========================================================================
    // Runtime Operations
    // =========================================================================

    /// Non-blocking check of the completion queue
    pub fn poll_once(&mut self) -> Result<CompletionPoll> {
        if self.state < SessionState::Accepted {
            return Err(CollectorError::InvalidState {
                expected: "Accepted",
                actual: self.state.as_str(),
            });
        }

        let poll = match self.endpoint_mut()?.poll_completion()? {
            Some(wc) => CompletionPoll::from(wc),
            None => CompletionPoll::Empty,
        };

        if let CompletionPoll::Failed { status, wr_id } = poll {
            tracing::warn!(
                "Poll for '{}' failed with status {:?} (work request ID: {})",
                self.name,
                status,
                wr_id
            );
        }
        Ok(poll)
    }

    /// Queue pair number, keys and PSN drift
    pub fn rdma_info(&self) -> Result<RdmaInfo> {
        self.expect_state(SessionState::Ready)?;

        let endpoint = self.endpoint_ref()?;
        let region = self.region.ok_or(CollectorError::InvalidState {
            expected: "Ready",
            actual: "no region",
        })?;
        let rq_psn = endpoint.receive_psn()? & PSN_MASK;
        let initial_psn = self.initial_psn.unwrap_or(rq_psn);

        Ok(RdmaInfo {
            qp_num: endpoint.qp_num(),
            lkey: region.lkey,
            rkey: region.rkey,
            rq_psn,
            initial_psn,
            psn_drift: psn_drift(rq_psn, initial_psn),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn region(&self) -> Option<MemoryRegion> {
        self.region
    }

    pub fn initial_psn(&self) -> Option<u32> {
        self.initial_psn
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(CollectorError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn EventChannel>> {
        let actual = self.state.as_str();
        self.channel.as_mut().ok_or(CollectorError::InvalidState {
            expected: "Listening",
            actual,
        })
    }

    fn endpoint_mut(&mut self) -> Result<&mut Box<dyn Endpoint>> {
        let actual = self.state.as_str();
        self.endpoint.as_mut().ok_or(CollectorError::InvalidState {
            expected: "Accepted",
            actual,
        })
    }

    fn endpoint_ref(&self) -> Result<&dyn Endpoint> {
        self.endpoint
            .as_deref()
            .ok_or(CollectorError::InvalidState {
                expected: "Accepted",
                actual: self.state.as_str(),
            })
    }

    /// Block until the next event, which must be of the `expected` kind
    fn wait_for_event(&mut self, expected: CmEventKind) -> Result<CmEvent> {
        let deadline = self.config.event_timeout.map(|t| Instant::now() + t);
        let interval = self.config.event_poll_interval;

        loop {
            if self.cancel.is_cancelled() {
                tracing::warn!("Wait for {:?} on '{}' cancelled", expected, self.name);
                return Err(CollectorError::Cancelled);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(CollectorError::Timeout(format!(
                        "no {:?} event for '{}' within {:?}",
                        expected,
                        self.name,
                        self.config.event_timeout.unwrap_or_default()
                    )));
                }
            }

            let event = match self.channel_mut()?.next_event(interval)? {
                Some(event) => event,
                None => continue,
            };

            tracing::debug!("Event detected for '{}': {:?}", self.name, event);

            if event.kind != expected {
                return Err(CollectorError::UnexpectedEvent {
                    expected,
                    got: event.kind,
                });
            }
            if event.status != 0 {
                return Err(CollectorError::Transport(format!(
                    "{:?} event for '{}' carried error {}",
                    event.kind, self.name, event.status
                )));
            }
            return Ok(event);
        }
    }

    /// Poll until the completion of `wr_id` arrives or the ack timeout hits
    fn wait_for_completion(&mut self, wr_id: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.advertise_ack_timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }

            let idle = match self.endpoint_mut()?.poll_completion()? {
                Some(wc) if wc.wr_id == wr_id => {
                    if wc.status == WcStatus::Success {
                        tracing::debug!("Peer of '{}' acknowledged work request {}", self.name, wr_id);
                        return Ok(());
                    }
                    return Err(CollectorError::Completion {
                        status: wc.status,
                        wr_id: wc.wr_id,
                    });
                }
                Some(wc) => {
                    tracing::debug!("Skipping unrelated completion on '{}': {:?}", self.name, wc);
                    false
                }
                None => true,
            };

            // A steady stream of unrelated completions must not outlast the deadline
            if Instant::now() >= deadline {
                return Err(CollectorError::Timeout(format!(
                    "peer of '{}' did not acknowledge work request {} within {:?}",
                    self.name, wr_id, self.config.advertise_ack_timeout
                )));
            }
            if idle {
                thread::sleep(ACK_POLL_INTERVAL);
            }
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            if let Some(region) = self.region.take() {
                if let Err(e) = endpoint.deregister_region(region.keys()) {
                    tracing::warn!("Failed to deregister region of '{}': {}", self.name, e);
                }
            }
            if let Err(e) = endpoint.disconnect() {
                tracing::warn!("Failed to disconnect '{}': {}", self.name, e);
            }
        }
        tracing::debug!("Session '{}' closed in state {}", self.name, self.state.as_str());
    }
}

/// Distance between two 24-bit packet sequence numbers
pub(crate) fn psn_drift(current: u32, initial: u32) -> u32 {
    current.wrapping_sub(initial) & PSN_MASK
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::ptr::NonNull;

    use super::*;
    use crate::config::{PagePolicy, QueuePairConfig};
    use crate::memory::PinnedBufferAllocator;
    use crate::transport::{ConnectionId, RegionKeys, WcOpcode, WorkCompletion};

    // =========================================================================
    // Scripted Fabric
    // =========================================================================

    /// Accepts one connection whose completion queue never runs dry and
    /// never acknowledges the metadata SEND
    struct ChattyFabric;

    struct ChattyChannel {
        events: VecDeque<CmEvent>,
    }

    struct ChattyEndpoint;

    impl Fabric for ChattyFabric {
        fn name(&self) -> &str {
            "chatty"
        }

        fn create_event_channel(&self) -> Result<Box<dyn EventChannel>> {
            let events = [CmEventKind::ConnectRequest, CmEventKind::Established]
                .into_iter()
                .map(|kind| CmEvent { kind, id: 1, status: 0 })
                .collect();
            Ok(Box::new(ChattyChannel { events }))
        }
    }

    impl EventChannel for ChattyChannel {
        fn bind(&mut self, _port: u16) -> Result<()> {
            Ok(())
        }

        fn listen(&mut self, _backlog: u32) -> Result<()> {
            Ok(())
        }

        fn next_event(&mut self, _timeout: Duration) -> Result<Option<CmEvent>> {
            Ok(self.events.pop_front())
        }

        fn accept(&mut self, _id: ConnectionId, _qp: &QueuePairConfig) -> Result<Box<dyn Endpoint>> {
            Ok(Box::new(ChattyEndpoint))
        }
    }

    impl Endpoint for ChattyEndpoint {
        fn qp_num(&self) -> u32 {
            1
        }

        unsafe fn register_region(
            &mut self,
            _addr: NonNull<u8>,
            _length: usize,
            _access: AccessFlags,
        ) -> Result<RegionKeys> {
            Ok(RegionKeys { lkey: 7, rkey: 7 })
        }

        fn deregister_region(&mut self, _keys: RegionKeys) -> Result<()> {
            Ok(())
        }

        fn post_send(&mut self, _wr_id: u64, _sge: ScatterGather, _signaled: bool) -> Result<()> {
            Ok(())
        }

        fn poll_completion(&mut self) -> Result<Option<WorkCompletion>> {
            Ok(Some(WorkCompletion {
                wr_id: ADVERTISE_WR_ID + 1,
                status: WcStatus::Success,
                opcode: WcOpcode::RdmaWrite,
            }))
        }

        fn receive_psn(&self) -> Result<u32> {
            Ok(0)
        }

        fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ack_wait_times_out_under_unrelated_completions() {
        let config = SessionConfig {
            event_timeout: Some(Duration::from_secs(1)),
            advertise_ack_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = TransportSession::new("chatty", Arc::new(ChattyFabric), config);
        session.listen_and_accept(1).unwrap();

        let buffer = PinnedBufferAllocator::new(PagePolicy::Standard)
            .allocate(4096)
            .unwrap();
        session.register_region(Arc::new(buffer)).unwrap();

        let started = Instant::now();
        let result = session.advertise_metadata();

        assert!(matches!(result, Err(CollectorError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::RegionRegistered);
    }

    #[test]
    fn test_psn_drift_wraps_at_24_bits() {
        assert_eq!(psn_drift(10, 4), 6);
        assert_eq!(psn_drift(2, PSN_MASK - 1), 4);
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(SessionState::Unbound < SessionState::Accepted);
        assert!(SessionState::MetadataAdvertised < SessionState::Ready);
    }
}
