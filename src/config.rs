//! Session manager configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default UDP port for signaling traffic.
pub const DEFAULT_PORT: u16 = 20005;

/// How often presence is re-registered to the relays.
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_secs(200);

/// Production relay fleet.
const DEFAULT_RELAYS: [&str; 6] = [
    "10.18.96.46:19001",
    "10.18.96.46:19002",
    "10.18.96.46:19003",
    "106.75.106.193:19001",
    "117.50.61.49:19001",
    "117.50.63.224:19001",
];

/// Runtime configuration of a [`crate::SessionManager`].
#[derive(Debug, Clone)]
pub struct SmConfig {
    /// UDP listen address.
    pub bind_addr: SocketAddr,
    /// Relay addresses every outbound message is fanned out to.
    pub relays: Vec<SocketAddr>,
    /// Interval between presence re-registrations.
    pub register_interval: Duration,
    /// Seed for session identifier allocation. `None` draws from entropy;
    /// tests pin it for deterministic allocation.
    pub sid_seed: Option<u64>,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            relays: default_relays(),
            register_interval: DEFAULT_REGISTER_INTERVAL,
            sid_seed: None,
        }
    }
}

/// The built-in relay address list.
pub fn default_relays() -> Vec<SocketAddr> {
    DEFAULT_RELAYS
        .iter()
        .map(|addr| addr.parse().expect("built-in relay address must parse"))
        .collect()
}
