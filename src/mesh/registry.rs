use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::channels::{ChannelLabel, ChannelSet};
use super::negotiation::{Negotiation, NegotiationState, Role};
use super::transfer::FileAssembler;
use crate::peer::{DataChannel, PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventSink};
use crate::protocol::ParticipantId;

/// Everything the session knows about one remote participant
pub struct PeerEntry {
    pub remote: ParticipantId,
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) negotiation: Negotiation,
    pub(crate) channels: ChannelSet,
    pub(crate) assembler: FileAssembler,
}

impl PeerEntry {
    pub(crate) fn new(remote: ParticipantId, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            remote,
            connection,
            negotiation: Negotiation::default(),
            channels: ChannelSet::default(),
            assembler: FileAssembler::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.remote.clone(),
            state: self.negotiation.state(),
            role: self.negotiation.role(),
            open_channels: self.channels.open_labels(),
        }
    }

    async fn close(mut self) {
        self.channels.clear();
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection to {}: {}", self.remote, e);
        }
    }
}

/// Snapshot of one peer entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: ParticipantId,
    pub state: NegotiationState,
    pub role: Option<Role>,
    pub open_channels: Vec<ChannelLabel>,
}

/// Remote id → peer entry. Owned by the session actor; entries are created on
/// first reference.
pub struct PeerRegistry {
    entries: HashMap<ParticipantId, PeerEntry>,
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>,
}

impl PeerRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        events: mpsc::UnboundedSender<(ParticipantId, PeerEvent)>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            connector,
            events,
        }
    }

    pub async fn get_or_create(&mut self, remote: ParticipantId) -> Result<&mut PeerEntry, PeerError> {
        if !self.entries.contains_key(&remote) {
            let sink = PeerEventSink::new(remote.clone(), self.events.clone());
            let connection = self.connector.connect(sink).await?;
            debug!("Peer entry created for {}", remote);
            self.entries
                .insert(remote.clone(), PeerEntry::new(remote.clone(), connection));
        }
        self.entries.get_mut(&remote).ok_or(PeerError::Closed)
    }

    pub fn get(&self, remote: &ParticipantId) -> Option<&PeerEntry> {
        self.entries.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ParticipantId) -> Option<&mut PeerEntry> {
        self.entries.get_mut(remote)
    }

    /// Drop the entry and close its connection. Returns false for unknown ids.
    pub async fn remove(&mut self, remote: &ParticipantId) -> bool {
        let Some(entry) = self.entries.remove(remote) else {
            return false;
        };
        info!("Closing peer {}", remote);
        entry.close().await;
        true
    }

    pub async fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.close().await;
        }
    }

    /// Open channels with `label`, one per peer that has it
    pub fn open_channels(&self, label: ChannelLabel) -> Vec<(ParticipantId, Arc<dyn DataChannel>)> {
        self.entries
            .values()
            .filter_map(|entry| entry.channels.open(label).map(|ch| (entry.remote.clone(), ch)))
            .collect()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.entries.values().map(PeerEntry::summary).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Peers whose negotiation started more than `timeout` ago and is still
    /// in progress
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.entries
            .values()
            .filter(|entry| entry.negotiation.is_overdue(now, timeout))
            .map(|entry| entry.remote.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
