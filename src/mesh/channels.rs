use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::registry::PeerEntry;
use super::transfer::CompletedFile;
use crate::peer::{ChannelPayload, DataChannel};
use crate::protocol::ParticipantId;

/// The three sub-channels multiplexed over every peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelLabel {
    Chat,
    File,
    Draw,
}

impl ChannelLabel {
    pub const ALL: [ChannelLabel; 3] = [ChannelLabel::Chat, ChannelLabel::File, ChannelLabel::Draw];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelLabel::Chat => "chat",
            ChannelLabel::File => "file",
            ChannelLabel::Draw => "draw",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "chat" => Some(ChannelLabel::Chat),
            "file" => Some(ChannelLabel::File),
            "draw" => Some(ChannelLabel::Draw),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel objects of one peer, by label
#[derive(Default)]
pub struct ChannelSet {
    chat: Option<Arc<dyn DataChannel>>,
    file: Option<Arc<dyn DataChannel>>,
    draw: Option<Arc<dyn DataChannel>>,
}

impl ChannelSet {
    fn slot(&mut self, label: ChannelLabel) -> &mut Option<Arc<dyn DataChannel>> {
        match label {
            ChannelLabel::Chat => &mut self.chat,
            ChannelLabel::File => &mut self.file,
            ChannelLabel::Draw => &mut self.draw,
        }
    }

    pub fn attach(&mut self, label: ChannelLabel, channel: Arc<dyn DataChannel>) {
        *self.slot(label) = Some(channel);
    }

    pub fn get(&self, label: ChannelLabel) -> Option<&Arc<dyn DataChannel>> {
        match label {
            ChannelLabel::Chat => self.chat.as_ref(),
            ChannelLabel::File => self.file.as_ref(),
            ChannelLabel::Draw => self.draw.as_ref(),
        }
    }

    /// Channel for `label` if it exists and is open
    pub fn open(&self, label: ChannelLabel) -> Option<Arc<dyn DataChannel>> {
        self.get(label).filter(|ch| ch.is_open()).cloned()
    }

    pub fn open_labels(&self) -> Vec<ChannelLabel> {
        ChannelLabel::ALL
            .into_iter()
            .filter(|label| self.open(*label).is_some())
            .collect()
    }

    pub fn clear(&mut self) {
        self.chat = None;
        self.file = None;
        self.draw = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: ParticipantId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: ParticipantId,
    pub name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawMessage {
    pub from: ParticipantId,
    pub event: serde_json::Value,
}

pub type ChatHandler = Box<dyn FnMut(ChatMessage) + Send>;
pub type FileHandler = Box<dyn FnMut(ReceivedFile) + Send>;
pub type DrawHandler = Box<dyn FnMut(DrawMessage) + Send>;

/// Routes channel traffic of every peer to single-slot callbacks.
///
/// Registering a handler replaces the previous one.
#[derive(Default)]
pub struct Multiplexer {
    on_chat: Option<ChatHandler>,
    on_file: Option<FileHandler>,
    on_draw: Option<DrawHandler>,
}

impl Multiplexer {
    pub fn set_chat_handler(&mut self, handler: ChatHandler) {
        self.on_chat = Some(handler);
    }

    pub fn set_file_handler(&mut self, handler: FileHandler) {
        self.on_file = Some(handler);
    }

    pub fn set_draw_handler(&mut self, handler: DrawHandler) {
        self.on_draw = Some(handler);
    }

    /// Responder side: the remote opened a channel
    pub fn attach(&self, entry: &mut PeerEntry, channel: Arc<dyn DataChannel>) {
        match ChannelLabel::parse(channel.label()) {
            Some(label) => {
                debug!("Channel '{}' from {} attached", label, entry.remote);
                entry.channels.attach(label, channel);
            }
            None => debug!(
                "Ignoring unknown channel '{}' from {}",
                channel.label(),
                entry.remote
            ),
        }
    }

    pub fn deliver(&mut self, entry: &mut PeerEntry, label: &str, payload: ChannelPayload) {
        let from = entry.remote.clone();
        match ChannelLabel::parse(label) {
            Some(ChannelLabel::Chat) => {
                let Some(text) = payload_text(payload) else {
                    warn!("Dropping non UTF-8 chat message from {}", from);
                    return;
                };
                match self.on_chat.as_mut() {
                    Some(handler) => handler(ChatMessage { from, text }),
                    None => debug!("No chat handler, dropping message from {}", from),
                }
            }

            Some(ChannelLabel::File) => match payload {
                ChannelPayload::Text(name) => entry.assembler.accept_name(name),
                ChannelPayload::Binary(chunk) => {
                    let Some(CompletedFile { name, data }) = entry.assembler.accept_chunk(chunk)
                    else {
                        warn!("File payload from {} arrived without a name", from);
                        return;
                    };
                    debug!("Received file '{}' ({} bytes) from {}", name, data.len(), from);
                    match self.on_file.as_mut() {
                        Some(handler) => handler(ReceivedFile { from, name, data }),
                        None => debug!("No file handler, dropping '{}'", name),
                    }
                }
            },

            Some(ChannelLabel::Draw) => {
                let parsed = match &payload {
                    ChannelPayload::Text(text) => serde_json::from_str(text),
                    ChannelPayload::Binary(data) => serde_json::from_slice(data),
                };
                let event = match parsed {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Malformed draw event from {}: {}", from, e);
                        return;
                    }
                };
                match self.on_draw.as_mut() {
                    Some(handler) => handler(DrawMessage { from, event }),
                    None => debug!("No draw handler, dropping event from {}", from),
                }
            }

            None => debug!("Message on unknown channel '{}' from {}", label, from),
        }
    }
}

fn payload_text(payload: ChannelPayload) -> Option<String> {
    match payload {
        ChannelPayload::Text(text) => Some(text),
        ChannelPayload::Binary(data) => String::from_utf8(data.to_vec()).ok(),
    }
}

/// Write `payloads` in order to every channel; returns how many channels took
/// all of them. Failing channels are skipped.
pub async fn fan_out(
    channels: Vec<(ParticipantId, Arc<dyn DataChannel>)>,
    payloads: &[ChannelPayload],
) -> usize {
    let mut delivered = 0;
    'channels: for (remote, channel) in channels {
        for payload in payloads {
            if let Err(e) = channel.send(payload.clone()).await {
                debug!("Skipping '{}' to {}: {}", channel.label(), remote, e);
                continue 'channels;
            }
        }
        delivered += 1;
    }
    delivered
}
