//! In-process peer backend.
//!
//! Descriptions are plain text naming the endpoint and the channel labels the
//! offerer created. Applying an answer links both endpoints: every offered
//! channel gets a twin on the answering side, announced through its event
//! sink, and both sides report `Connected`. Channel messages travel through
//! the receiving session's event queue, so they keep their send order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::debug;

use super::{
    ChannelPayload, ConnectionState, DataChannel, PeerConnection, PeerConnector, PeerError,
    PeerEvent, PeerEventSink, SignalingState,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const SDP_PREFIX: &str = "loopback";

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<u64, Weak<Endpoint>>,
    next_endpoint: u64,
    unreachable: bool,
}

/// Shared in-process "network" that loopback peers register with
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unreachable, applying an answer reports `Failed` on both sides
    /// instead of linking them
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
        }
    }

    fn register(&self, endpoint: &Arc<Endpoint>) {
        let mut state = lock(&self.state);
        state.endpoints.insert(endpoint.id, Arc::downgrade(endpoint));
    }

    fn next_id(&self) -> u64 {
        let mut state = lock(&self.state);
        state.next_endpoint += 1;
        state.next_endpoint
    }

    fn lookup(&self, id: u64) -> Option<Arc<Endpoint>> {
        let mut state = lock(&self.state);
        state.endpoints.retain(|_, weak| weak.strong_count() > 0);
        state.endpoints.get(&id).and_then(Weak::upgrade)
    }

    fn is_reachable(&self) -> bool {
        !lock(&self.state).unreachable
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let endpoint = Arc::new(Endpoint {
            id: self.network.next_id(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        self.network.register(&endpoint);
        Ok(Arc::new(LoopbackPeer {
            endpoint,
            network: self.network.clone(),
        }))
    }
}

struct EndpointState {
    signaling: SignalingState,
    connection: ConnectionState,
    has_remote: bool,
    /// created locally, linked when the answer arrives
    pending: Vec<Arc<LoopbackChannel>>,
    channels: Vec<Arc<LoopbackChannel>>,
    remote_candidates: usize,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            has_remote: false,
            pending: Vec::new(),
            channels: Vec::new(),
            remote_candidates: 0,
        }
    }
}

struct Endpoint {
    id: u64,
    events: PeerEventSink,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn set_connection(&self, connection: ConnectionState) {
        lock(&self.state).connection = connection;
        self.events.emit(PeerEvent::StateChanged(connection));
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

struct LoopbackPeer {
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
}

impl LoopbackPeer {
    fn describe(&self, kind: SdpKind, labels: &[String]) -> SessionDescription {
        let sdp = format!("{} {} {}", SDP_PREFIX, self.endpoint.id, labels.join(","));
        SessionDescription { kind, sdp }
    }

    fn trickle(&self) {
        self.endpoint
            .events
            .emit(PeerEvent::LocalCandidate(Some(self.endpoint.host_candidate())));
        self.endpoint.events.emit(PeerEvent::LocalCandidate(None));
    }

    /// Offerer side: wire our pending channels to twins on the answerer
    fn link(&self, remote: Arc<Endpoint>) {
        if !self.network.is_reachable() {
            debug!(
                "Loopback endpoints {} and {} unreachable",
                self.endpoint.id, remote.id
            );
            self.endpoint.set_connection(ConnectionState::Failed);
            remote.set_connection(ConnectionState::Failed);
            return;
        }

        let pending = std::mem::take(&mut lock(&self.endpoint.state).pending);
        let mut twins = Vec::with_capacity(pending.len());
        for local in &pending {
            let twin = Arc::new(LoopbackChannel::new(local.label.clone()));
            LoopbackChannel::pair(local, &twin, &self.endpoint.events, &remote.events);
            twins.push(twin);
        }

        lock(&self.endpoint.state).channels.extend(pending);
        lock(&remote.state).channels.extend(twins.iter().cloned());

        for twin in twins {
            remote.events.emit(PeerEvent::DataChannel(twin));
        }
        self.endpoint.set_connection(ConnectionState::Connected);
        remote.set_connection(ConnectionState::Connected);
        debug!("Loopback endpoints {} and {} linked", self.endpoint.id, remote.id);
    }
}

fn parse_description(desc: &SessionDescription) -> Result<(u64, Vec<String>), PeerError> {
    let mut parts = desc.sdp.splitn(3, ' ');
    if parts.next() != Some(SDP_PREFIX) {
        return Err(PeerError::InvalidDescription(desc.sdp.clone()));
    }
    let endpoint = parts
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| PeerError::InvalidDescription(desc.sdp.clone()))?;
    let labels = parts
        .next()
        .unwrap_or("")
        .split(',')
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    Ok((endpoint, labels))
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.endpoint.state).signaling
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let mut state = lock(&self.endpoint.state);
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        let channel = Arc::new(LoopbackChannel::new(label.to_string()));
        state.pending.push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let labels: Vec<String> = {
            let state = lock(&self.endpoint.state);
            if state.signaling != SignalingState::Stable {
                return Err(PeerError::InvalidState("offer requires stable state"));
            }
            state.pending.iter().map(|c| c.label.clone()).collect()
        };
        Ok(self.describe(SdpKind::Offer, &labels))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState("answer requires a remote offer"));
        }
        Ok(self.describe(SdpKind::Answer, &[]))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        parse_description(&desc)?;
        {
            let mut state = lock(&self.endpoint.state);
            state.signaling = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                _ => return Err(PeerError::InvalidState("unexpected local description")),
            };
            state.connection = ConnectionState::Connecting;
        }
        self.trickle();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let (remote_id, _labels) = parse_description(&desc)?;
        {
            let mut state = lock(&self.endpoint.state);
            state.signaling = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                _ => return Err(PeerError::InvalidState("unexpected remote description")),
            };
            state.has_remote = true;
        }

        if desc.kind == SdpKind::Answer {
            match self.network.lookup(remote_id) {
                Some(remote) => self.link(remote),
                None => self.endpoint.set_connection(ConnectionState::Failed),
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = lock(&self.endpoint.state);
        if !state.has_remote {
            return Err(PeerError::InvalidState("remote description not set"));
        }
        state.remote_candidates += 1;
        debug!(
            "Loopback endpoint {} took remote candidate #{}",
            self.endpoint.id, state.remote_candidates
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let channels = {
            let mut state = lock(&self.endpoint.state);
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            debug!(
                "Closing loopback endpoint {} ({:?})",
                self.endpoint.id, state.connection
            );
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.pending.clear();
            std::mem::take(&mut state.channels)
        };
        let mut far = None;
        for channel in channels {
            far = channel.shutdown().or(far);
        }
        if let Some(far) = far {
            far.emit(PeerEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// One end of an ordered, reliable loopback channel
pub(crate) struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    /// remote session's sink, set when linked
    far: Mutex<Option<PeerEventSink>>,
    twin: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: String) -> Self {
        Self {
            label,
            open: AtomicBool::new(false),
            far: Mutex::new(None),
            twin: Mutex::new(Weak::new()),
        }
    }

    /// `a` lives on the side whose events go to `a_events`
    fn pair(a: &Arc<Self>, b: &Arc<Self>, a_events: &PeerEventSink, b_events: &PeerEventSink) {
        *lock(&a.far) = Some(b_events.clone());
        *lock(&b.far) = Some(a_events.clone());
        *lock(&a.twin) = Arc::downgrade(b);
        *lock(&b.twin) = Arc::downgrade(a);
        a.open.store(true, Ordering::SeqCst);
        b.open.store(true, Ordering::SeqCst);
    }

    /// Close both ends; returns the far side's sink if it was linked
    fn shutdown(&self) -> Option<PeerEventSink> {
        self.open.store(false, Ordering::SeqCst);
        let twin = lock(&self.twin).upgrade()?;
        twin.open.store(false, Ordering::SeqCst);
        lock(&self.far).clone()
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && lock(&self.far).as_ref().is_some_and(|far| !far.is_closed())
    }

    async fn send(&self, payload: ChannelPayload) -> Result<(), PeerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PeerError::ChannelClosed(self.label.clone()));
        }
        let far = lock(&self.far).clone();
        match far {
            Some(far)
                if far.emit(PeerEvent::ChannelMessage {
                    label: self.label.clone(),
                    payload,
                }) =>
            {
                Ok(())
            }
            _ => Err(PeerError::ChannelClosed(self.label.clone())),
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(twin) = lock(&self.twin).upgrade() {
            twin.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
