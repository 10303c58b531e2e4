//! Error types for the Outway core library.

use thiserror::Error;

/// Result type alias using the Outway core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for tunnel operations.
///
/// These carry the classification the UI needs to localise a failure;
/// lower-level detail (process exit codes, socket errors) is folded into
/// the message text.
#[derive(Debug, Error)]
pub enum Error {
    /// The proxy server could not be reached over TCP, or its hostname
    /// did not resolve within the DNS timeout.
    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    /// The transport configuration is missing or malformed. Raised before
    /// anything is launched or any routing is touched.
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// The privileged routing helper refused or failed a request.
    #[error("Routing service error: {0}")]
    RoutingService(String),

    /// The forwarding process failed in a way that is not covered by a
    /// more specific classification.
    #[error("Forwarding process error: {0}")]
    ForwardingProcess(String),

    /// A tunnel operation was invoked from a phase that does not permit it.
    #[error("Invalid tunnel state: {0}")]
    InvalidState(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
