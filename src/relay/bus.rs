use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::types::{ConnectionId, RelayError, RelayFrame};

/// Commands sent to the relay bus actor
pub(crate) enum BusCommand {
    Attach {
        tx: mpsc::UnboundedSender<RelayFrame>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Detach {
        id: ConnectionId,
    },
    Broadcast {
        from: ConnectionId,
        frame: RelayFrame,
    },
    OpenConnections {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) async fn relay_bus_actor(mut rx: mpsc::Receiver<BusCommand>) {
    let mut connections: HashMap<ConnectionId, mpsc::UnboundedSender<RelayFrame>> =
        HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            BusCommand::Attach { tx, reply } => {
                next_id += 1;
                let id = ConnectionId(next_id);
                connections.insert(id, tx);
                info!("Connection {} attached ({} open)", id, connections.len());
                let _ = reply.send(id);
            }

            BusCommand::Detach { id } => {
                if connections.remove(&id).is_some() {
                    info!("Connection {} detached ({} open)", id, connections.len());
                }
            }

            BusCommand::Broadcast { from, frame } => {
                // a closed queue never reopens
                connections.retain(|_, tx| !tx.is_closed());

                let mut delivered = 0usize;
                for (id, tx) in &connections {
                    if *id == from {
                        continue;
                    }
                    if tx.send(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                debug!(
                    "Relayed {} bytes from {} to {} connections",
                    frame.len(),
                    from,
                    delivered
                );
            }

            BusCommand::OpenConnections { reply } => {
                let open = connections.values().filter(|tx| !tx.is_closed()).count();
                let _ = reply.send(open);
            }
        }
    }
}

/// Handle to the relay bus actor.
///
/// The bus has no notion of rooms: every frame goes to every other open
/// connection.
#[derive(Clone)]
pub struct RelayBus {
    pub(crate) tx: mpsc::Sender<BusCommand>,
}

impl RelayBus {
    /// Spawn the bus actor on the current runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<BusCommand>(1024);
        tokio::spawn(relay_bus_actor(rx));
        Self { tx }
    }

    /// Register a connection; frames from other connections arrive on the
    /// returned receiver
    pub async fn attach(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<RelayFrame>), RelayError> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BusCommand::Attach {
                tx: frame_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RelayError::BusClosed)?;
        let id = reply_rx.await.map_err(|_| RelayError::BusClosed)?;
        Ok((id, frame_rx))
    }

    pub async fn detach(&self, id: ConnectionId) {
        let _ = self.tx.send(BusCommand::Detach { id }).await;
    }

    /// Fan a frame out to every open connection except `from`
    pub async fn broadcast(&self, from: ConnectionId, frame: RelayFrame) -> Result<(), RelayError> {
        self.tx
            .send(BusCommand::Broadcast { from, frame })
            .await
            .map_err(|_| RelayError::BusClosed)
    }

    pub async fn open_connections(&self) -> Result<usize, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BusCommand::OpenConnections { reply: reply_tx })
            .await
            .map_err(|_| RelayError::BusClosed)?;
        reply_rx.await.map_err(|_| RelayError::BusClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let bus = RelayBus::spawn();
        let (a, mut a_rx) = bus.attach().await.unwrap();
        let (_b, mut b_rx) = bus.attach().await.unwrap();
        let (_c, mut c_rx) = bus.attach().await.unwrap();

        bus.broadcast(a, RelayFrame::from("ping")).await.unwrap();
        assert_eq!(bus.open_connections().await.unwrap(), 3);

        assert_eq!(b_rx.recv().await.unwrap(), RelayFrame::from("ping"));
        assert_eq!(c_rx.recv().await.unwrap(), RelayFrame::from("ping"));
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connection_misses_messages_silently() {
        let bus = RelayBus::spawn();
        let (a, _a_rx) = bus.attach().await.unwrap();
        let (_b, b_rx) = bus.attach().await.unwrap();
        let (_c, mut c_rx) = bus.attach().await.unwrap();
        drop(b_rx);

        bus.broadcast(a, RelayFrame::from("one")).await.unwrap();
        assert_eq!(c_rx.recv().await.unwrap(), RelayFrame::from("one"));
        assert_eq!(bus.open_connections().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let bus = RelayBus::spawn();
        let (a, _a_rx) = bus.attach().await.unwrap();
        let (_b, mut b_rx) = bus.attach().await.unwrap();

        for i in 0..50 {
            bus.broadcast(a, RelayFrame::from(i.to_string())).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(b_rx.recv().await.unwrap().as_text(), Some(i.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let bus = RelayBus::spawn();
        let (a, _a_rx) = bus.attach().await.unwrap();
        let (b, mut b_rx) = bus.attach().await.unwrap();
        bus.detach(b).await;

        bus.broadcast(a, RelayFrame::from("gone")).await.unwrap();
        assert_eq!(bus.open_connections().await.unwrap(), 1);
        // sender side dropped by the actor, so the queue ends
        assert!(b_rx.recv().await.is_none());
    }
}
