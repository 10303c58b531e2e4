//! Outway Tunnel Core
//!
//! Composes the tun2socks forwarding process and the privileged routing
//! helper into one logical VPN tunnel:
//! - Child process supervision with deterministic exit reporting
//! - Forwarding process lifecycle with auto-restart
//! - Routing daemon adapter over a local socket
//! - Tunnel orchestration (connect, disconnect, suspend/resume, network
//!   changes) with a single ordered status stream

pub mod connectivity;
pub mod events;
pub mod orchestrator;
pub mod process;
pub mod routing;
pub mod store;
pub mod tun2socks;

pub use events::{PowerEvent, StatusEvent};
pub use orchestrator::{Forwarder, PlatformCapabilities, TunnelSession};
pub use process::{ProcessError, ProcessSupervisor};
pub use routing::{RoutingEvent, RoutingService};
pub use tun2socks::Tun2socksController;
