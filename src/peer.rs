//! Peer-connection primitive consumed by the mesh.
//!
//! A backend hands the session an object per remote participant that can
//! produce and apply session descriptions, accept trickled candidates and open
//! labeled data channels. Everything the backend observes asynchronously
//! (local candidates, announced channels, inbound channel messages, connection
//! state) is pushed through a [`PeerEventSink`] into the owning session's
//! event queue; backends never touch session state directly.

mod loopback;
mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};

pub use loopback::{LoopbackConnector, LoopbackNetwork};
pub use rtc::RtcConnector;

/// Errors reported by a peer-connection backend
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid signaling state: {0}")]
    InvalidState(&'static str),

    #[error("data channel '{0}' is not open")]
    ChannelClosed(String),

    #[error("peer connection closed")]
    Closed,
}

/// JSEP signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One data-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

pub enum PeerEvent {
    /// A local candidate was gathered; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    ChannelMessage {
        label: String,
        payload: ChannelPayload,
    },
    StateChanged(ConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            PeerEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("payload", payload)
                .finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Where a backend reports events for one remote participant
#[derive(Clone, Debug)]
pub struct PeerEventSink {
    remote: ParticipantId,
    tx: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(remote: ParticipantId, tx: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>) -> Self {
        Self { remote, tx }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Returns false once the owning session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.remote.clone(), event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, payload: ChannelPayload) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Create a channel locally; it is announced to the remote side as part
    /// of the next offer
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
