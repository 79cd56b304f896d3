//! Bounded credential storage.
//!
//! Every field has a hard length cap; a write that exceeds its cap is
//! dropped (the caller sees the old value). Session token and expiry are
//! cleared as a unit, and registration writes all three node fields or none.

/// Caps in bytes. Load-bearing: request construction and the persisted state
/// file both assume fields never exceed them.
pub const MAX_SESSION_TOKEN: usize = 255;
pub const MAX_NODE_ID: usize = 63;
pub const MAX_NODE_AUTH_TOKEN: usize = 127;
pub const MAX_TUNNEL_URL: usize = 191;

/// Mutable credential set owned by the agent.
///
/// Invariant: an empty `session_token` implies `session_expires_at_ms == 0`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    session_token: String,
    session_expires_at_ms: u64,
    node_id: String,
    node_auth_token: String,
    tunnel_url: String,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session token with its monotonic expiry deadline
    /// (`0` = no TTL known). Oversized tokens are dropped.
    pub fn set_session(&mut self, token: &str, expires_at_ms: u64) {
        if token.is_empty() || token.len() > MAX_SESSION_TOKEN {
            return;
        }
        self.session_token.clear();
        self.session_token.push_str(token);
        self.session_expires_at_ms = expires_at_ms;
    }

    /// Extend the expiry of an existing session. No-op without a token.
    pub fn extend_session(&mut self, expires_at_ms: u64) {
        if !self.session_token.is_empty() {
            self.session_expires_at_ms = expires_at_ms;
        }
    }

    /// Write node identity credentials atomically: if any field exceeds its
    /// cap, nothing changes. `tunnel_url` may be empty.
    pub fn set_registration(&mut self, node_id: &str, auth_token: &str, tunnel_url: &str) -> bool {
        if node_id.is_empty()
            || node_id.len() > MAX_NODE_ID
            || auth_token.is_empty()
            || auth_token.len() > MAX_NODE_AUTH_TOKEN
            || tunnel_url.len() > MAX_TUNNEL_URL
        {
            return false;
        }
        self.node_id = node_id.to_string();
        self.node_auth_token = auth_token.to_string();
        self.tunnel_url = tunnel_url.to_string();
        true
    }

    /// Overwrite only the tunnel URL (server-provided during session grant).
    pub fn set_tunnel_url(&mut self, tunnel_url: &str) {
        if tunnel_url.len() > MAX_TUNNEL_URL {
            return;
        }
        self.tunnel_url = tunnel_url.to_string();
    }

    /// Overwrite only the node id (pair responses carry one without an auth
    /// token).
    pub fn set_node_id(&mut self, node_id: &str) {
        if node_id.is_empty() || node_id.len() > MAX_NODE_ID {
            return;
        }
        self.node_id = node_id.to_string();
    }

    pub fn set_node_auth_token(&mut self, token: &str) {
        if token.is_empty() || token.len() > MAX_NODE_AUTH_TOKEN {
            return;
        }
        self.node_auth_token = token.to_string();
    }

    pub fn has_session(&self) -> bool {
        !self.session_token.is_empty()
    }

    /// A session is valid while a token exists and the deadline (if any) has
    /// not passed.
    pub fn session_valid(&self, now_ms: u64) -> bool {
        self.has_session() && (self.session_expires_at_ms == 0 || now_ms < self.session_expires_at_ms)
    }

    /// Drop the session token and its expiry together.
    pub fn clear_session(&mut self) {
        self.session_token.clear();
        self.session_expires_at_ms = 0;
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn session_expires_at_ms(&self) -> u64 {
        self.session_expires_at_ms
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_auth_token(&self) -> &str {
        &self.node_auth_token
    }

    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }
}

/// Maximum failed pair submissions before the code is discarded.
pub const MAX_PAIRING_FAILURES: u8 = 5;

/// Transient pairing material from a HELLO response.
///
/// `expires_at` is opaque — stored for operator visibility, never parsed.
#[derive(Debug, Clone)]
pub struct PairingState {
    pub code: String,
    pub expires_at: Option<String>,
    pub failures: u8,
}

impl PairingState {
    pub fn new(code: &str, expires_at: Option<&str>) -> Self {
        Self {
            code: code.to_string(),
            expires_at: expires_at.map(str::to_string),
            failures: 0,
        }
    }

    /// Record a failed submission; returns `true` when the code should be
    /// discarded.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures >= MAX_PAIRING_FAILURES
    }
}
