//! WebSocket relay that fans signaling messages out to every other participant

mod bus;
mod link;
mod server;
mod types;

pub use bus::RelayBus;
pub use link::{RelayLink, RelaySender};
pub use server::RelayServer;
pub use types::{ConnectionId, RelayError, RelayFrame};
