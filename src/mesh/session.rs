use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::channels::{
    ChannelLabel, ChatMessage, DrawMessage, Multiplexer, ReceivedFile, fan_out,
};
use super::negotiation::{NegotiationState, Signaler, Step};
use super::registry::{PeerEntry, PeerRegistry, PeerSummary};
use crate::config::SessionConfig;
use crate::peer::{ChannelPayload, DataChannel, PeerConnector, PeerEvent};
use crate::protocol::{ParticipantId, RelayMessage, RoomId, Signal};
use crate::relay::{RelayError, RelayFrame, RelayLink};

/// Floor for the timeout sweep period
const MIN_SWEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("session closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

type ChannelList = Vec<(ParticipantId, Arc<dyn DataChannel>)>;

/// Commands sent to the session actor
pub(crate) enum SessionCommand {
    OpenChannels {
        label: ChannelLabel,
        reply: oneshot::Sender<ChannelList>,
    },
    OnChat {
        handler: Box<dyn FnMut(ChatMessage) + Send>,
        reply: oneshot::Sender<()>,
    },
    OnFile {
        handler: Box<dyn FnMut(ReceivedFile) + Send>,
        reply: oneshot::Sender<()>,
    },
    OnDraw {
        handler: Box<dyn FnMut(DrawMessage) + Send>,
        reply: oneshot::Sender<()>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    PeerState {
        remote: ParticipantId,
        reply: oneshot::Sender<Option<NegotiationState>>,
    },
    ClosePeer {
        remote: ParticipantId,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// One participant in a mesh room.
///
/// Runs as an actor that owns the peer registry; relay messages, backend
/// events and handle commands are processed one at a time.
pub struct Session {
    signaler: Signaler,
    registry: PeerRegistry,
    mux: Multiplexer,
    timeout: Option<Duration>,
    joined: watch::Sender<bool>,
}

impl Session {
    /// Connect to the relay at `config.relay_url` and announce ourselves
    pub async fn join_room(
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<SessionHandle, SessionError> {
        let link = RelayLink::connect(&config.relay_url).await?;
        Self::join_with_link(config, link, connector)
    }

    /// Join over an already open relay link
    pub fn join_with_link(
        config: SessionConfig,
        link: RelayLink,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<SessionHandle, SessionError> {
        let local = ParticipantId::generate();
        let (relay, relay_rx) = link.into_parts();
        let signaler = Signaler::new(config.room_id.clone(), local.clone(), relay);
        if !signaler.announce() {
            return Err(SessionError::Closed);
        }
        info!("Joined room {} as {}", config.room_id, local);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (joined_tx, joined_rx) = watch::channel(true);

        let session = Session {
            signaler,
            registry: PeerRegistry::new(connector, events_tx),
            mux: Multiplexer::default(),
            timeout: config.negotiation_timeout,
            joined: joined_tx,
        };
        tokio::spawn(session.run(relay_rx, events_rx, cmd_rx));

        Ok(SessionHandle {
            local,
            room: config.room_id,
            tx: cmd_tx,
            joined: joined_rx,
        })
    }

    async fn run(
        mut self,
        mut relay_rx: mpsc::UnboundedReceiver<RelayFrame>,
        mut events_rx: mpsc::UnboundedReceiver<(ParticipantId, PeerEvent)>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let period = self
            .timeout
            .map_or(Duration::from_secs(3600), |t| (t / 4).max(MIN_SWEEP));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut relay_open = true;

        loop {
            tokio::select! {
                frame = relay_rx.recv(), if relay_open => match frame {
                    Some(frame) => self.on_relay_frame(frame).await,
                    None => {
                        info!("Relay link closed; peer links stay up");
                        relay_open = false;
                        self.joined.send_replace(false);
                    }
                },

                Some((remote, event)) = events_rx.recv() => self.on_peer_event(remote, event),

                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Leave { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("All session handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                _ = sweep.tick(), if self.timeout.is_some() => self.sweep().await,
            }
        }
        debug!("Session {} finished", self.signaler.local());
    }

    async fn on_relay_frame(&mut self, frame: RelayFrame) {
        let Some(text) = frame.as_text() else {
            warn!("Ignoring binary relay frame ({} bytes)", frame.len());
            return;
        };
        match RelayMessage::from_json(text) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => warn!("Malformed relay message: {}", e),
        }
    }

    async fn dispatch(&mut self, msg: RelayMessage) {
        let local = self.signaler.local();
        if msg.sender == *local {
            return;
        }
        if &msg.room_id != self.signaler.room() {
            debug!("Ignoring {} for room {}", msg.signal.kind(), msg.room_id);
            return;
        }
        if msg.target.as_ref().is_some_and(|target| target != local) {
            debug!("Ignoring {} for {:?}", msg.signal.kind(), msg.target);
            return;
        }

        let remote = msg.sender;
        let kind = msg.signal.kind();
        debug!("<- {} from {}", kind, remote);
        let entry = match self.registry.get_or_create(remote.clone()).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not create a connection for {}: {}", remote, e);
                return;
            }
        };

        let step = match msg.signal {
            Signal::JoinRoom => entry.on_join(&self.signaler).await,
            Signal::NewPeer => entry.on_new_peer(&self.signaler).await,
            Signal::Offer { sdp } => entry.on_offer(sdp, &self.signaler).await,
            Signal::Answer { sdp } => entry.on_answer(sdp).await,
            Signal::Candidate { candidate } => entry.on_candidate(candidate).await,
        };
        match step {
            Step::Ignored(reason) => debug!("{} from {} ignored: {}", kind, remote, reason),
            _ => debug!("{} is {:?} after {}", remote, entry.state(), kind),
        }
    }

    fn on_peer_event(&mut self, remote: ParticipantId, event: PeerEvent) {
        let Some(entry) = self.registry.get_mut(&remote) else {
            debug!("Dropping {:?} for closed peer {}", event, remote);
            return;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                entry.on_local_candidate(candidate, &self.signaler);
            }
            PeerEvent::DataChannel(channel) => self.mux.attach(entry, channel),
            PeerEvent::ChannelMessage { label, payload } => self.mux.deliver(entry, &label, payload),
            PeerEvent::StateChanged(state) => {
                entry.on_connection_state(state);
            }
        }
    }

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::OpenChannels { label, reply } => {
                let _ = reply.send(self.registry.open_channels(label));
            }
            SessionCommand::OnChat { handler, reply } => {
                self.mux.set_chat_handler(handler);
                let _ = reply.send(());
            }
            SessionCommand::OnFile { handler, reply } => {
                self.mux.set_file_handler(handler);
                let _ = reply.send(());
            }
            SessionCommand::OnDraw { handler, reply } => {
                self.mux.set_draw_handler(handler);
                let _ = reply.send(());
            }
            SessionCommand::Peers { reply } => {
                let _ = reply.send(self.registry.summaries());
            }
            SessionCommand::PeerState { remote, reply } => {
                let _ = reply.send(self.registry.get(&remote).map(PeerEntry::state));
            }
            SessionCommand::ClosePeer { remote, reply } => {
                let _ = reply.send(self.registry.remove(&remote).await);
            }
            // handled by the run loop
            SessionCommand::Leave { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn sweep(&mut self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        for remote in self.registry.overdue(Instant::now(), timeout) {
            if let Some(entry) = self.registry.get_mut(&remote) {
                entry.time_out().await;
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(
            "Leaving room {} ({} peers)",
            self.signaler.room(),
            self.registry.len()
        );
        self.registry.clear().await;
        self.joined.send_replace(false);
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    local: ParticipantId,
    room: RoomId,
    tx: mpsc::Sender<SessionCommand>,
    joined: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn local_id(&self) -> ParticipantId {
        self.local.clone()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    /// Whether the relay link is still up
    pub fn is_joined(&self) -> bool {
        *self.joined.borrow()
    }

    pub fn joined(&self) -> watch::Receiver<bool> {
        self.joined.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    async fn broadcast(
        &self,
        label: ChannelLabel,
        payloads: &[ChannelPayload],
    ) -> Result<usize, SessionError> {
        let channels = self
            .request(|reply| SessionCommand::OpenChannels { label, reply })
            .await?;
        Ok(fan_out(channels, payloads).await)
    }

    /// Send `text` on every open chat channel; returns how many peers got it
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<usize, SessionError> {
        self.broadcast(ChannelLabel::Chat, &[ChannelPayload::Text(text.into())])
            .await
    }

    /// Filename as text, then the payload as one binary message, per peer
    pub async fn send_file(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<usize, SessionError> {
        let payloads = [
            ChannelPayload::Text(name.into()),
            ChannelPayload::Binary(data.into()),
        ];
        self.broadcast(ChannelLabel::File, &payloads).await
    }

    pub async fn broadcast_draw<T: Serialize + ?Sized>(
        &self,
        event: &T,
    ) -> Result<usize, SessionError> {
        let json = serde_json::to_string(event)?;
        self.broadcast(ChannelLabel::Draw, &[ChannelPayload::Text(json)])
            .await
    }

    /// Replaces any previous chat handler
    pub async fn on_chat(
        &self,
        handler: impl FnMut(ChatMessage) + Send + 'static,
    ) -> Result<(), SessionError> {
        let handler = Box::new(handler);
        self.request(|reply| SessionCommand::OnChat { handler, reply })
            .await
    }

    pub async fn on_file(
        &self,
        handler: impl FnMut(ReceivedFile) + Send + 'static,
    ) -> Result<(), SessionError> {
        let handler = Box::new(handler);
        self.request(|reply| SessionCommand::OnFile { handler, reply })
            .await
    }

    pub async fn on_draw(
        &self,
        handler: impl FnMut(DrawMessage) + Send + 'static,
    ) -> Result<(), SessionError> {
        let handler = Box::new(handler);
        self.request(|reply| SessionCommand::OnDraw { handler, reply })
            .await
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, SessionError> {
        self.request(|reply| SessionCommand::Peers { reply }).await
    }

    pub async fn peer_state(
        &self,
        remote: ParticipantId,
    ) -> Result<Option<NegotiationState>, SessionError> {
        self.request(|reply| SessionCommand::PeerState { remote, reply })
            .await
    }

    /// Close the link to one peer; false if it was unknown
    pub async fn close_peer(&self, remote: ParticipantId) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::ClosePeer { remote, reply })
            .await
    }

    /// Close every peer link and stop the session
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }
}
