//! Event types crossing the tunnel core's boundaries.

use outway_core::TunnelStatus;

/// Capacity of the status and power broadcast channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One status transition of one tunnel.
///
/// Emitted on the status broadcast channel in the order the transitions
/// occurred; transitions for the same tunnel are never sent concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Identifier of the tunnel the transition belongs to.
    pub tunnel_id: String,
    /// The new status.
    pub status: TunnelStatus,
}

/// OS power transition, delivered by platform glue outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// The machine is about to suspend.
    Suspend,
    /// The machine woke up.
    Resume,
}
