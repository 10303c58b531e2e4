//! Tunnel connectivity status shared between the core and UI consumers.

use serde::{Deserialize, Serialize};

/// Authoritative connectivity status of one tunnel.
///
/// Transitions are emitted on the status broadcast channel, never polled
/// destructively; every consumer sees the same ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelStatus {
    /// Traffic is flowing through the tunnel.
    Connected,
    /// The tunnel is fully torn down.
    Disconnected,
    /// Connectivity was interrupted (network change, suspend) and the core
    /// is re-establishing it without user involvement.
    Reconnecting,
    /// An explicit or fault-triggered teardown is in progress.
    Disconnecting,
}

impl TunnelStatus {
    /// Check if the tunnel is usable for traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the tunnel is in a transient state.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}
