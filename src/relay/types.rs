use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay bus closed")]
    BusClosed,
}

/// Identifier the bus assigns to each attached connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opaque payload carried by the bus.
///
/// Both variants wrap refcounted buffers so fan-out clones are O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl RelayFrame {
    pub fn len(&self) -> usize {
        match self {
            RelayFrame::Text(text) => text.as_str().len(),
            RelayFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RelayFrame::Text(text) => Some(text.as_str()),
            RelayFrame::Binary(_) => None,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            RelayFrame::Text(text) => Message::Text(text),
            RelayFrame::Binary(data) => Message::Binary(data),
        }
    }
}

impl From<String> for RelayFrame {
    fn from(s: String) -> Self {
        RelayFrame::Text(Utf8Bytes::from(s))
    }
}

impl From<&str> for RelayFrame {
    fn from(s: &str) -> Self {
        RelayFrame::Text(Utf8Bytes::from(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_exposes_str() {
        let frame = RelayFrame::from("hello");
        assert_eq!(frame.as_text(), Some("hello"));
        assert_eq!(frame.len(), 5);
    }

    #[test]
    fn binary_frame_has_no_text() {
        let frame = RelayFrame::Binary(Bytes::from_static(&[1, 2, 3]));
        assert!(frame.as_text().is_none());
        assert!(!frame.is_empty());
    }

    #[test]
    fn frame_maps_to_matching_ws_message() {
        let text = RelayFrame::from("x").into_message();
        assert!(matches!(text, Message::Text(_)));
        let binary = RelayFrame::Binary(Bytes::new()).into_message();
        assert!(matches!(binary, Message::Binary(_)));
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn#7");
    }
}
