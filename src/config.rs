//! Runtime configuration for the relay server and mesh sessions

use std::time::Duration;

use crate::protocol::RoomId;

pub const DEFAULT_RELAY_PORT: u16 = 3001;
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_BIND: &str = "MESHROOM_BIND";
const ENV_PING_SECS: &str = "MESHROOM_PING_SECS";
const ENV_PONG_SECS: &str = "MESHROOM_PONG_SECS";
const ENV_ICE: &str = "MESHROOM_ICE";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_RELAY_PORT),
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `MESHROOM_BIND`, `MESHROOM_PING_SECS` and
    /// `MESHROOM_PONG_SECS` when set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND) {
            config.bind_addr = addr;
        }
        if let Some(secs) = lookup(ENV_PING_SECS).and_then(|s| s.parse().ok()) {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup(ENV_PONG_SECS).and_then(|s| s.parse().ok()) {
            config.pong_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Settings for one participant session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub room_id: RoomId,
    /// Deadline for a negotiation to reach the connected state.
    /// `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(relay_url: impl Into<String>, room_id: impl Into<RoomId>) -> Self {
        Self {
            relay_url: relay_url.into(),
            room_id: room_id.into(),
            negotiation_timeout: None,
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }
}

/// ICE server URLs from `MESHROOM_ICE` (comma separated); empty when unset
pub fn ice_servers_from_env() -> Vec<String> {
    parse_ice_servers(std::env::var(ENV_ICE).ok().as_deref())
}

fn parse_ice_servers(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
