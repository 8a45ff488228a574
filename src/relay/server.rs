use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::bus::RelayBus;
use super::types::{RelayError, RelayFrame};
use crate::config::RelayConfig;

pub struct RelayServer {
    listener: TcpListener,
    bus: RelayBus,
    config: RelayConfig,
}

impl RelayServer {
    /// Bind the listener and spawn the bus actor
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            bus: RelayBus::spawn(),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The bus behind this server; in-process participants attach here
    pub fn bus(&self) -> RelayBus {
        self.bus.clone()
    }

    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let bus = self.bus.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, bus, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Ping/pong bookkeeping for one connection
struct Keepalive {
    pong_timeout: Duration,
    /// Set while a ping is unanswered
    deadline: Option<Instant>,
}

impl Keepalive {
    fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            deadline: None,
        }
    }

    /// Arm the pong deadline. False if the previous ping is still unanswered.
    fn ping(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Instant::now() + self.pong_timeout);
        true
    }

    fn pong(&mut self) {
        self.deadline = None;
    }
}

async fn pong_overdue(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Text and binary frames go to the bus; control frames yield `None`
fn relay_frame(msg: Message) -> Option<RelayFrame> {
    match msg {
        Message::Text(text) => Some(RelayFrame::Text(text)),
        Message::Binary(data) => Some(RelayFrame::Binary(data)),
        _ => None,
    }
}

/// One task per connection: reads the socket, writes bus frames and pings
/// back to it, and detaches from the bus on the way out.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    bus: RelayBus,
    config: RelayConfig,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (conn_id, mut outbound) = bus.attach().await?;
    info!("WebSocket connection from {} as {}", addr, conn_id);

    let mut pings = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut keepalive = Keepalive::new(config.pong_timeout);

    loop {
        tokio::select! {
            _ = pings.tick() => {
                if !keepalive.ping() {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                debug!("Ping sent to {}", addr);
            }

            _ = pong_overdue(keepalive.deadline) => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(frame.into_message()).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Pong(_) => {
                        keepalive.pong();
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    msg => {
                        let Some(frame) = relay_frame(msg) else { continue };
                        if bus.broadcast(conn_id, frame).await.is_err() {
                            error!("Relay bus gone, dropping {}", addr);
                            break;
                        }
                    }
                }
            }
        }
    }

    bus.detach(conn_id).await;
    let _ = ws_tx.close().await;
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}
