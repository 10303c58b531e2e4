//! Persisted last-tunnel state.
//!
//! One JSON blob on disk describing the tunnel that was active at last
//! shutdown. Consumed at startup to decide whether to auto-reconnect,
//! written on successful connect, cleared on explicit disconnect.

use std::path::PathBuf;

use tracing::debug;

use outway_core::Result;
use outway_core::persisted::LastTunnel;

/// File-backed store for the last active tunnel.
pub struct LastTunnelStore {
    path: PathBuf,
}

impl LastTunnelStore {
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("outway").join("last_tunnel.json"))
    }

    /// Load the persisted tunnel, `None` when nothing was persisted.
    pub fn load(&self) -> Result<Option<LastTunnel>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the given tunnel, creating parent directories as needed.
    pub fn save(&self, tunnel: &LastTunnel) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(tunnel)?)?;
        debug!(path = %self.path.display(), tunnel_id = %tunnel.id, "persisted last tunnel");
        Ok(())
    }

    /// Forget the persisted tunnel. No-op when nothing was persisted.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
