use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::bus::RelayBus;
use super::types::{RelayError, RelayFrame};

/// Outbound half of a relay link. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<String>,
}

impl RelaySender {
    /// Queue a text frame; returns false when the link is closed
    pub fn send(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sender whose frames land in the returned queue
    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// A participant's connection to the relay: ordered text frames out, relayed
/// frames from everyone else in.
pub struct RelayLink {
    sender: RelaySender,
    inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

impl RelayLink {
    /// Open a WebSocket connection to a relay server
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!("Connected to relay {}", url);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayFrame>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => RelayFrame::Text(text),
                    Ok(Message::Binary(data)) => RelayFrame::Binary(data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
            debug!("Relay reader finished");
        });

        Ok(Self {
            sender: RelaySender { tx: out_tx },
            inbound: in_rx,
        })
    }

    /// Attach directly to an in-process bus
    pub async fn attach(bus: &RelayBus) -> Result<Self, RelayError> {
        let (conn_id, inbound) = bus.attach().await?;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if bus.broadcast(conn_id, RelayFrame::from(text)).await.is_err() {
                    break;
                }
            }
            bus.detach(conn_id).await;
        });

        Ok(Self {
            sender: RelaySender { tx: out_tx },
            inbound,
        })
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        sender: RelaySender,
        inbound: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        Self { sender, inbound }
    }

    pub fn into_parts(self) -> (RelaySender, mpsc::UnboundedReceiver<RelayFrame>) {
        (self.sender, self.inbound)
    }
}
