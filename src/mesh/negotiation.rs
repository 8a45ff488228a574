//! Per-peer offer/answer/candidate state machine.
//!
//! `New → HaveLocalOffer | HaveRemoteOffer → Connected | Failed`. Of any two
//! participants only the one with the lower id offers: it initiates when it
//! hears the other's `join-room` or a `new-peer` addressed to it, and the
//! higher side answers a `join-room` with a targeted `new-peer` instead of an
//! offer. Two joins that cross on the relay therefore still produce a single
//! offer. A responder always answers and never re-offers. Every transition is
//! guarded on the current state because relay messages for a peer may arrive
//! while an earlier step is still pending.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channels::ChannelLabel;
use super::registry::PeerEntry;
use crate::peer::{ConnectionState, PeerError, SignalingState};
use crate::protocol::{IceCandidate, ParticipantId, RelayMessage, RoomId, SessionDescription, Signal};
use crate::relay::RelaySender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Failed,
}

impl NegotiationState {
    /// `Failed` is permanent; nothing retries
    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Failed
    }

    fn is_pending(self) -> bool {
        matches!(
            self,
            NegotiationState::HaveLocalOffer | NegotiationState::HaveRemoteOffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Negotiation {
    state: NegotiationState,
    role: Option<Role>,
    started: Option<Instant>,
}

impl Negotiation {
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    fn begin(&mut self, role: Role) {
        self.role = Some(role);
        self.started = Some(Instant::now());
    }

    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.state.is_pending()
            && self
                .started
                .is_some_and(|started| now.saturating_duration_since(started) >= timeout)
    }
}

/// Outcome of feeding one input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Applied,
    /// Not valid in the current state; nothing changed
    Ignored(&'static str),
    Failed,
}

/// Writes this participant's signaling messages to the relay
#[derive(Clone, Debug)]
pub struct Signaler {
    room: RoomId,
    local: ParticipantId,
    relay: RelaySender,
}

impl Signaler {
    pub fn new(room: RoomId, local: ParticipantId, relay: RelaySender) -> Self {
        Self { room, local, relay }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Whether we make the offer towards `remote`
    pub fn offers_to(&self, remote: &ParticipantId) -> bool {
        self.local < *remote
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Untargeted `join-room` for everyone on the relay
    pub fn announce(&self) -> bool {
        self.send(RelayMessage::new(self.room.clone(), self.local.clone(), Signal::JoinRoom))
    }

    pub fn emit(&self, target: ParticipantId, signal: Signal) -> bool {
        self.send(RelayMessage::new(self.room.clone(), self.local.clone(), signal).to(target))
    }

    fn send(&self, msg: RelayMessage) -> bool {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not encode {} message: {}", msg.signal.kind(), e);
                return false;
            }
        };
        debug!("-> {} for {:?}", msg.signal.kind(), msg.target);
        self.relay.send(text)
    }
}

impl PeerEntry {
    /// `join-room` from this peer: offer if we hold the lower id, otherwise
    /// ask the peer to offer to us
    pub async fn on_join(&mut self, signaler: &Signaler) -> Step {
        if self.negotiation.state != NegotiationState::New {
            return Step::Ignored("announcement outside the new state");
        }
        if signaler.offers_to(&self.remote) {
            return self.initiate(signaler).await;
        }
        debug!("Asking {} to offer", self.remote);
        signaler.emit(self.remote.clone(), Signal::NewPeer);
        Step::Applied
    }

    /// `new-peer` from this peer: it expects our offer
    pub async fn on_new_peer(&mut self, signaler: &Signaler) -> Step {
        if !signaler.offers_to(&self.remote) {
            return Step::Ignored("new-peer from the side that offers");
        }
        self.initiate(signaler).await
    }

    /// Open the three channels, then offer. Only from `New`.
    pub async fn initiate(&mut self, signaler: &Signaler) -> Step {
        if self.negotiation.state != NegotiationState::New {
            debug!("Not initiating with {}: {:?}", self.remote, self.negotiation.state);
            return Step::Ignored("initiate outside the new state");
        }
        self.negotiation.begin(Role::Initiator);
        info!("Initiating negotiation with {}", self.remote);
        match self.offer(signaler).await {
            Ok(()) => Step::Applied,
            Err(e) => self.fail("offer", e),
        }
    }

    async fn offer(&mut self, signaler: &Signaler) -> Result<(), PeerError> {
        for label in ChannelLabel::ALL {
            let channel = self.connection.create_data_channel(label.as_str()).await?;
            self.channels.attach(label, channel);
        }
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.negotiation.state = NegotiationState::HaveLocalOffer;
        signaler.emit(self.remote.clone(), Signal::Offer { sdp: offer.sdp });
        Ok(())
    }

    pub async fn on_offer(&mut self, sdp: String, signaler: &Signaler) -> Step {
        if self.negotiation.state != NegotiationState::New {
            debug!("Ignoring offer from {} in {:?}", self.remote, self.negotiation.state);
            return Step::Ignored("offer outside the new state");
        }
        self.negotiation.begin(Role::Responder);
        info!("Answering offer from {}", self.remote);
        match self.answer(sdp, signaler).await {
            Ok(()) => Step::Applied,
            Err(e) => self.fail("answer", e),
        }
    }

    async fn answer(&mut self, sdp: String, signaler: &Signaler) -> Result<(), PeerError> {
        self.connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.negotiation.state = NegotiationState::HaveRemoteOffer;
        signaler.emit(self.remote.clone(), Signal::Answer { sdp: answer.sdp });
        Ok(())
    }

    /// Applies only while our offer is still outstanding on both levels
    pub async fn on_answer(&mut self, sdp: String) -> Step {
        if self.negotiation.state != NegotiationState::HaveLocalOffer
            || self.connection.signaling_state() != SignalingState::HaveLocalOffer
        {
            debug!("Ignoring answer from {} in {:?}", self.remote, self.negotiation.state);
            return Step::Ignored("answer without an outstanding offer");
        }
        match self
            .connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            Ok(()) => Step::Applied,
            Err(e) => self.fail("remote answer", e),
        }
    }

    /// `None` marks the end of the remote's candidates
    pub async fn on_candidate(&mut self, candidate: Option<IceCandidate>) -> Step {
        if self.negotiation.state.is_terminal() {
            return Step::Ignored("negotiation failed");
        }
        let Some(candidate) = candidate else {
            return Step::Ignored("end of candidates");
        };
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => Step::Applied,
            Err(e) => {
                // one bad path does not sink the link
                warn!("Candidate from {} rejected: {}", self.remote, e);
                Step::Ignored("candidate rejected")
            }
        }
    }

    /// Trickle a locally gathered candidate
    pub fn on_local_candidate(&self, candidate: Option<IceCandidate>, signaler: &Signaler) -> Step {
        if self.negotiation.state.is_terminal() {
            return Step::Ignored("negotiation failed");
        }
        let Some(candidate) = candidate else {
            debug!("Candidate gathering for {} complete", self.remote);
            return Step::Ignored("end of gathering");
        };
        signaler.emit(
            self.remote.clone(),
            Signal::Candidate {
                candidate: Some(candidate),
            },
        );
        Step::Applied
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) -> Step {
        let current = self.negotiation.state;
        match state {
            ConnectionState::Connected if !current.is_terminal() => {
                info!("Connected to {}", self.remote);
                self.negotiation.state = NegotiationState::Connected;
                Step::Applied
            }
            ConnectionState::Failed => self.mark_failed("transport failed"),
            ConnectionState::Closed | ConnectionState::Disconnected
                if current != NegotiationState::Connected && !current.is_terminal() =>
            {
                self.mark_failed("closed before connecting")
            }
            ConnectionState::Closed => {
                info!("Connection to {} closed", self.remote);
                self.channels.clear();
                Step::Applied
            }
            _ => Step::Ignored("no transition"),
        }
    }

    /// Give up on a negotiation that missed its deadline
    pub async fn time_out(&mut self) {
        if !self.negotiation.state.is_pending() {
            return;
        }
        self.mark_failed("negotiation timed out");
        if let Err(e) = self.connection.close().await {
            debug!("Closing timed out connection to {}: {}", self.remote, e);
        }
    }

    fn fail(&mut self, step: &'static str, error: PeerError) -> Step {
        warn!("Negotiation with {} failed at {}: {}", self.remote, step, error);
        self.negotiation.state = NegotiationState::Failed;
        self.channels.clear();
        Step::Failed
    }

    fn mark_failed(&mut self, reason: &'static str) -> Step {
        if self.negotiation.state.is_terminal() {
            return Step::Ignored("already failed");
        }
        warn!("Negotiation with {} failed: {}", self.remote, reason);
        self.negotiation.state = NegotiationState::Failed;
        self.channels.clear();
        Step::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{LoopbackNetwork, PeerConnector, PeerEvent, PeerEventSink};
    use tokio::sync::mpsc;

    type Events = mpsc::UnboundedReceiver<(ParticipantId, PeerEvent)>;

    struct Side {
        entry: PeerEntry,
        events: Events,
        signaler: Signaler,
        outbox: mpsc::UnboundedReceiver<String>,
    }

    async fn side(network: &LoopbackNetwork, local: &str, remote: &str) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let remote = ParticipantId::from(remote);
        let connection = network
            .connector()
            .connect(PeerEventSink::new(remote.clone(), tx))
            .await
            .unwrap();
        let (relay, outbox) = RelaySender::channel();
        Side {
            entry: PeerEntry::new(remote, connection),
            events,
            signaler: Signaler::new(RoomId::from("room"), ParticipantId::from(local), relay),
            outbox,
        }
    }

    fn next_signal(side: &mut Side) -> RelayMessage {
        let text = side.outbox.try_recv().expect("a relay message was emitted");
        RelayMessage::from_json(&text).unwrap()
    }

    /// Feed queued backend events through the state machine
    fn pump(side: &mut Side) {
        while let Ok((_, event)) = side.events.try_recv() {
            match event {
                PeerEvent::StateChanged(state) => {
                    side.entry.on_connection_state(state);
                }
                PeerEvent::DataChannel(channel) => {
                    if let Some(label) = ChannelLabel::parse(channel.label()) {
                        side.entry.channels.attach(label, channel);
                    }
                }
                PeerEvent::LocalCandidate(candidate) => {
                    side.entry.on_local_candidate(candidate, &side.signaler);
                }
                PeerEvent::ChannelMessage { .. } => {}
            }
        }
    }

    #[tokio::test]
    async fn initiate_emits_targeted_offer() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;

        assert_eq!(a.entry.initiate(&a.signaler).await, Step::Applied);
        assert_eq!(a.entry.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(a.entry.negotiation.role(), Some(Role::Initiator));

        let msg = next_signal(&mut a);
        assert_eq!(msg.sender, ParticipantId::from("alice"));
        assert_eq!(msg.target, Some(ParticipantId::from("bob")));
        assert!(matches!(msg.signal, Signal::Offer { .. }));

        assert!(matches!(
            a.entry.initiate(&a.signaler).await,
            Step::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn full_exchange_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        let mut b = side(&network, "bob", "alice").await;

        a.entry.initiate(&a.signaler).await;
        let Signal::Offer { sdp } = next_signal(&mut a).signal else {
            panic!("expected offer");
        };
        assert_eq!(b.entry.on_offer(sdp, &b.signaler).await, Step::Applied);
        assert_eq!(b.entry.state(), NegotiationState::HaveRemoteOffer);

        let Signal::Answer { sdp } = next_signal(&mut b).signal else {
            panic!("expected answer");
        };
        assert_eq!(a.entry.on_answer(sdp.clone()).await, Step::Applied);
        // a duplicate answer hits the signaling-state guard
        assert!(matches!(a.entry.on_answer(sdp).await, Step::Ignored(_)));

        pump(&mut a);
        pump(&mut b);
        assert_eq!(a.entry.state(), NegotiationState::Connected);
        assert_eq!(b.entry.state(), NegotiationState::Connected);
        assert_eq!(b.entry.channels.open_labels(), ChannelLabel::ALL.to_vec());

        // local candidates were trickled to the other side
        let candidate = next_signal(&mut a);
        assert!(matches!(
            candidate.signal,
            Signal::Candidate { candidate: Some(_) }
        ));
        assert!(a.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn lower_id_offers_on_join() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;

        assert_eq!(a.entry.on_join(&a.signaler).await, Step::Applied);
        assert_eq!(a.entry.state(), NegotiationState::HaveLocalOffer);
        assert!(matches!(next_signal(&mut a).signal, Signal::Offer { .. }));
        // a repeated announcement changes nothing
        assert!(matches!(a.entry.on_join(&a.signaler).await, Step::Ignored(_)));
        assert!(a.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn higher_id_asks_for_an_offer_on_join() {
        let network = LoopbackNetwork::new();
        let mut b = side(&network, "bob", "alice").await;

        assert_eq!(b.entry.on_join(&b.signaler).await, Step::Applied);
        assert_eq!(b.entry.state(), NegotiationState::New);
        assert_eq!(b.entry.negotiation.role(), None);
        let msg = next_signal(&mut b);
        assert_eq!(msg.signal, Signal::NewPeer);
        assert_eq!(msg.target, Some(ParticipantId::from("alice")));

        // new-peer only makes the lower side offer
        assert!(matches!(
            b.entry.on_new_peer(&b.signaler).await,
            Step::Ignored(_)
        ));
        assert_eq!(b.entry.state(), NegotiationState::New);
    }

    #[tokio::test]
    async fn crossed_joins_produce_one_offer() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        let mut b = side(&network, "bob", "alice").await;

        // each side hears the other's join-room before anything else
        a.entry.on_join(&a.signaler).await;
        b.entry.on_join(&b.signaler).await;
        let offer = next_signal(&mut a);
        let new_peer = next_signal(&mut b);
        assert_eq!(new_peer.signal, Signal::NewPeer);

        // bob's request reaches alice after she already offered
        assert!(matches!(
            a.entry.on_new_peer(&a.signaler).await,
            Step::Ignored(_)
        ));
        let Signal::Offer { sdp } = offer.signal else {
            panic!("expected offer");
        };
        assert_eq!(b.entry.on_offer(sdp, &b.signaler).await, Step::Applied);
        let Signal::Answer { sdp } = next_signal(&mut b).signal else {
            panic!("expected answer");
        };
        assert_eq!(a.entry.on_answer(sdp).await, Step::Applied);

        pump(&mut a);
        pump(&mut b);
        assert_eq!(a.entry.state(), NegotiationState::Connected);
        assert_eq!(b.entry.state(), NegotiationState::Connected);
        assert_eq!(a.entry.negotiation.role(), Some(Role::Initiator));
        assert_eq!(b.entry.negotiation.role(), Some(Role::Responder));
    }

    #[tokio::test]
    async fn answer_without_offer_is_a_no_op() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        let step = a.entry.on_answer("loopback 1 ".to_string()).await;
        assert!(matches!(step, Step::Ignored(_)));
        assert_eq!(a.entry.state(), NegotiationState::New);
    }

    #[tokio::test]
    async fn second_offer_is_ignored() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        let mut b = side(&network, "bob", "alice").await;
        a.entry.initiate(&a.signaler).await;
        let Signal::Offer { sdp } = next_signal(&mut a).signal else {
            panic!("expected offer");
        };
        b.entry.on_offer(sdp.clone(), &b.signaler).await;
        assert!(matches!(
            b.entry.on_offer(sdp, &b.signaler).await,
            Step::Ignored(_)
        ));
        assert_eq!(b.entry.negotiation.role(), Some(Role::Responder));
    }

    #[tokio::test]
    async fn end_of_candidates_is_accepted() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        assert!(matches!(a.entry.on_candidate(None).await, Step::Ignored(_)));
        assert_eq!(a.entry.state(), NegotiationState::New);
    }

    #[tokio::test]
    async fn malformed_offer_fails_the_entry() {
        let network = LoopbackNetwork::new();
        let mut b = side(&network, "bob", "alice").await;
        let step = b.entry.on_offer("v=0 garbage".to_string(), &b.signaler).await;
        assert_eq!(step, Step::Failed);
        assert_eq!(b.entry.state(), NegotiationState::Failed);
        assert!(b.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_states_before_connecting_fail() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        a.entry.initiate(&a.signaler).await;

        assert_eq!(
            a.entry.on_connection_state(ConnectionState::Closed),
            Step::Failed
        );
        assert_eq!(a.entry.state(), NegotiationState::Failed);
        assert!(a.entry.channels.open_labels().is_empty());
        assert!(matches!(
            a.entry.on_connection_state(ConnectionState::Connected),
            Step::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn overdue_negotiation_times_out() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        assert!(!a.entry.negotiation.is_overdue(Instant::now(), Duration::ZERO));

        a.entry.initiate(&a.signaler).await;
        assert!(a.entry.negotiation.is_overdue(Instant::now(), Duration::ZERO));
        assert!(!a
            .entry
            .negotiation
            .is_overdue(Instant::now(), Duration::from_secs(3600)));

        a.entry.time_out().await;
        assert_eq!(a.entry.state(), NegotiationState::Failed);
        assert!(!a.entry.negotiation.is_overdue(Instant::now(), Duration::ZERO));
    }

    #[tokio::test]
    async fn connected_entry_drops_channels_on_close() {
        let network = LoopbackNetwork::new();
        let mut a = side(&network, "alice", "bob").await;
        a.entry.negotiation.state = NegotiationState::Connected;
        assert_eq!(
            a.entry.on_connection_state(ConnectionState::Closed),
            Step::Applied
        );
        assert_eq!(a.entry.state(), NegotiationState::Connected);
    }
}
