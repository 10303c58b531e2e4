//! Persisted last-tunnel state.
//!
//! A single JSON blob describing the tunnel that was active at last
//! shutdown, consumed at startup to decide whether to auto-reconnect.

use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;

/// The tunnel that was active when the app last shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastTunnel {
    /// Tunnel identifier (stable across restarts).
    pub id: String,
    /// Display name for the UI.
    pub name: String,
    /// Transport configuration to reconnect with.
    pub transport: TransportConfig,
    /// Whether UDP forwarding was supported at last connect.
    #[serde(default = "default_udp")]
    pub udp_enabled: bool,
}

const fn default_udp() -> bool {
    true
}
