//! Best-effort credential persistence.
//!
//! A single JSON state file under the configured data directory. Loss or
//! corruption is tolerated: the agent falls back to the HELLO flow. The
//! persisted session token is only ever used to drive one SESSION REFRESH
//! attempt at boot, so a stale file cannot fake an active session.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";

/// On-disk layout. `session_expires_at` is wall-clock RFC 3339 for operator
/// visibility; the in-memory deadline is monotonic and re-derived by refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub session_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_auth_token: String,
    #[serde(default)]
    pub tunnel_url: String,
}

/// Handle on the state file. `None` from [`StateStore::new`] disables
/// persistence entirely.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: &str) -> Option<Self> {
        if data_dir.is_empty() {
            return None;
        }
        Some(Self {
            path: PathBuf::from(data_dir).join(STATE_FILE),
        })
    }

    /// Read and parse the state file. Any failure yields `None`.
    pub async fn load(&self) -> Option<PersistedState> {
        let raw = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Ignoring corrupt state file {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Write the state file, creating the directory if needed. Failures are
    /// logged and swallowed.
    pub async fn save(&self, state: &PersistedState) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Cannot create {}: {e}", parent.display());
                return;
            }
        }
        let bytes = match serde_json::to_vec_pretty(state) {
            Ok(b) => b,
            Err(e) => {
                warn!("Cannot serialize state: {e}");
                return;
            }
        };
        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => debug!("Persisted state to {}", self.path.display()),
            Err(e) => warn!("Cannot write {}: {e}", self.path.display()),
        }
    }
}
