//! Relay wire format shared by the relay bus and mesh participants

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const PARTICIPANT_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PARTICIPANT_ID_LEN: usize = 8;

/// Participant identifier.
///
/// Locally generated ids are 8 base36 characters; ids coming off the wire are
/// opaque and kept as sent. Ordering is plain string order, which decides who
/// offers when two participants meet.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Arc<str>);

impl ParticipantId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..PARTICIPANT_ID_LEN)
            .map(|_| PARTICIPANT_ID_CHARS[rng.random_range(0..PARTICIPANT_ID_CHARS.len())] as char)
            .collect();
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantId({})", self.as_str())
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ParticipantId::from)
    }
}

/// Room identifier chosen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Tag-specific part of a relay message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    /// Announce ourselves to everyone on the relay
    #[serde(rename = "join-room")]
    JoinRoom,

    /// Explicit new-participant notification
    #[serde(rename = "new-peer")]
    NewPeer,

    #[serde(rename = "offer")]
    Offer { sdp: String },

    #[serde(rename = "answer")]
    Answer { sdp: String },

    /// Trickled candidate; absent or null marks end-of-candidates
    #[serde(rename = "candidate")]
    Candidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::JoinRoom => "join-room",
            Signal::NewPeer => "new-peer",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }
}

/// One message on the relay.
///
/// `target` is optional: messages without it are meant for every participant
/// in the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub room_id: RoomId,
    pub sender: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ParticipantId>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl RelayMessage {
    pub fn new(room_id: RoomId, sender: ParticipantId, signal: Signal) -> Self {
        Self {
            room_id,
            sender,
            target: None,
            signal,
        }
    }

    pub fn to(mut self, target: ParticipantId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_generate_has_correct_format() {
        let id = ParticipantId::generate();
        assert_eq!(id.as_str().len(), 8);
        for c in id.as_str().chars() {
            assert!(c.is_ascii_lowercase() || c.is_ascii_digit(), "Invalid char: {}", c);
        }
    }

    #[test]
    fn long_participant_ids_survive_the_wire() {
        let long = "x".repeat(40);
        let msg = RelayMessage::new(
            RoomId::from("lobby"),
            ParticipantId::from(format!("{}a", long)),
            Signal::JoinRoom,
        )
        .to(ParticipantId::from(format!("{}b", long)));

        let back = RelayMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back.sender.as_str().len(), 41);
        assert_eq!(back, msg);
        // a shared prefix does not make two ids equal
        assert_ne!(back.sender, back.target.unwrap());
    }

    #[test]
    fn participant_ids_order_as_strings() {
        assert!(ParticipantId::from("a1") < ParticipantId::from("b0"));
        assert!(ParticipantId::from("abc") < ParticipantId::from("abcd"));
    }

    #[test]
    fn participant_id_serialization() {
        let id = ParticipantId::from("k3j9x0aa");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"k3j9x0aa\"");
        let back: ParticipantId = serde_json::from_str("\"k3j9x0aa\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_join_room() {
        let json = r#"{"type":"join-room","roomId":"lobby","sender":"abc12345"}"#;
        let msg = RelayMessage::from_json(json).unwrap();
        assert_eq!(msg.signal, Signal::JoinRoom);
        assert_eq!(msg.room_id.as_str(), "lobby");
        assert_eq!(msg.sender.as_str(), "abc12345");
        assert!(msg.target.is_none());
    }

    #[test]
    fn parse_browser_offer() {
        // spread RTCSessionDescription plus routing fields
        let json = r#"{"sdp":"v=0\r\n","type":"offer","roomId":"lobby","sender":"abc12345"}"#;
        let msg = RelayMessage::from_json(json).unwrap();
        assert_eq!(
            msg.signal,
            Signal::Offer {
                sdp: "v=0\r\n".to_string()
            }
        );
    }

    #[test]
    fn parse_candidate_with_browser_fields() {
        let json = r#"{"type":"candidate","roomId":"r","sender":"abc12345",
            "candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"uf"}}"#;
        let msg = RelayMessage::from_json(json).unwrap();
        match msg.signal {
            Signal::Candidate {
                candidate: Some(c),
            } => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("uf"));
            }
            other => panic!("Expected candidate, got {:?}", other),
        }
    }

    #[test]
    fn parse_end_of_candidates() {
        let null = r#"{"type":"candidate","roomId":"r","sender":"a","candidate":null}"#;
        let absent = r#"{"type":"candidate","roomId":"r","sender":"a"}"#;
        for json in [null, absent] {
            let msg = RelayMessage::from_json(json).unwrap();
            assert_eq!(msg.signal, Signal::Candidate { candidate: None });
        }
    }

    #[test]
    fn serialize_targeted_answer() {
        let msg = RelayMessage::new(
            RoomId::from("lobby"),
            ParticipantId::from("aaaa1111"),
            Signal::Answer {
                sdp: "v=0".to_string(),
            },
        )
        .to(ParticipantId::from("bbbb2222"));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["roomId"], "lobby");
        assert_eq!(value["sender"], "aaaa1111");
        assert_eq!(value["target"], "bbbb2222");
        assert_eq!(value["sdp"], "v=0");
    }

    #[test]
    fn untargeted_message_omits_target() {
        let msg = RelayMessage::new(
            RoomId::from("lobby"),
            ParticipantId::from("aaaa1111"),
            Signal::NewPeer,
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("new-peer"));
        assert!(!json.contains("target"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let json = r#"{"type":"bogus","roomId":"r","sender":"a"}"#;
        assert!(RelayMessage::from_json(json).is_err());
    }
}
