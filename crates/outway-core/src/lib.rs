//! Outway Core Library
//!
//! Shared functionality for Outway components:
//! - Transport configuration (the serialized proxy connection parameters)
//! - Tunnel status state shared between the tunnel core and UI consumers
//! - Persisted last-tunnel state
//! - Common error types

pub mod config;
pub mod error;
pub mod persisted;
pub mod status;
pub mod tracing_init;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use status::TunnelStatus;
