//! The agent state machine and tick driver.
//!
//! A single [`Agent`] owns the credentials, the retry ladders, the hub HTTP
//! transport, the tunnel socket, and the stream multiplexor. The embedder
//! calls [`Agent::tick`] repeatedly; each tick drains tunnel events,
//! performs at most the I/O its per-kind action clocks allow, and applies
//! state transitions. Nothing blocks beyond the transport timeouts, and
//! nothing is torn down from inside an event path — disconnects set a flag
//! that the next tick acts on.
//!
//! State diagram (simplified):
//!
//! ```text
//! BOOT ──link up──▶ HELLO ──pairing──▶ PAIR_SUBMIT ──2xx──▶ ACTIVE
//!   │                 │ └─no pairing─▶ PENDING_POLL ──GRANTED─┘ │
//!   │ persisted token │                      │ DENIED           │
//!   └──refresh ok──▶ ACTIVE             ERROR ◀┘    TUNNEL_CONNECTING
//!                                                        │ register_ack
//!                                                  TUNNEL_CONNECTED
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffLadder, Clock, MonotonicClock, StepLadder, TUNNEL_SCHEDULE_MS};
use crate::config::AgentConfig;
use crate::credentials::{Credentials, PairingState};
use crate::hub::{HubClient, HubError, HubResponse, HubTransport};
use crate::identity::{self, NodeIdentity};
use crate::store::{PersistedState, StateStore};
use crate::tunnel::{RequestHandler, SocketEvent, StreamMux, TunnelSocket, WsTransport};

/// Cap on the retained human-readable error message, in bytes.
pub const MAX_LAST_ERROR: usize = 127;

/// Tunnel keepalive interval after a successful register_ack.
const KEEPALIVE_INTERVAL_MS: u64 = 25_000;

/// Lifecycle states, ordered by progress through the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Boot,
    Hello,
    PairSubmit,
    PendingPoll,
    Granted,
    Active,
    TunnelConnecting,
    TunnelConnected,
    Error,
}

impl NodeState {
    /// States with a live session (heartbeat, commands, tunnel all run).
    pub fn is_active_family(self) -> bool {
        matches!(
            self,
            NodeState::Active | NodeState::TunnelConnecting | NodeState::TunnelConnected
        )
    }
}

/// Observer callbacks. Each fires on the tick thread and must not re-enter
/// the agent.
#[derive(Default)]
pub struct Hooks {
    /// Fired exactly once per distinct state transition.
    pub on_state_change: Option<Box<dyn FnMut(NodeState, NodeState) + Send>>,
    /// Fired once per distinct `last_error` message.
    pub on_error: Option<Box<dyn FnMut(&str) + Send>>,
    /// Fired whenever the session is cleared because the hub rejected it.
    pub on_session_invalid: Option<Box<dyn FnMut() + Send>>,
    /// Fired with `true` on register_ack, `false` on tunnel teardown.
    pub on_tunnel: Option<Box<dyn FnMut(bool) + Send>>,
    /// Fired once per successful node registration with the node id.
    pub on_registered: Option<Box<dyn FnMut(&str) + Send>>,
    /// Fired for each pulled command `(id, action)` before it is acked.
    pub on_command: Option<Box<dyn FnMut(&str, &str) + Send>>,
}

/// Link-layer status. Host networking is managed by the OS, so the default
/// implementation reports the link as always up.
pub trait LinkMonitor: Send {
    fn is_up(&self) -> bool {
        true
    }
    fn rssi_dbm(&self) -> i32 {
        0
    }
}

/// Default monitor for hosts with OS-managed networking.
pub struct AlwaysUp;

impl LinkMonitor for AlwaysUp {}

/// Transport stand-in for an agent disabled by bad configuration.
struct DisabledHub;

#[async_trait::async_trait]
impl HubTransport for DisabledHub {
    async fn post_json(
        &mut self,
        _path: &str,
        _body: &Value,
        _bearer: Option<&str>,
        _extra_headers: &[(&str, &str)],
    ) -> Result<HubResponse, HubError> {
        Err(HubError::Transport("agent disabled by configuration".to_string()))
    }
}

/// The edge agent core.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) identity: NodeIdentity,
    state: NodeState,
    /// Set for construction-time configuration errors; the state machine
    /// never leaves ERROR while this is set.
    fatal: bool,
    pub(crate) creds: Credentials,
    pub(crate) pairing: Option<PairingState>,
    /// Token recovered from disk, consumed by the one-shot refresh at boot.
    persisted_token: Option<String>,
    refresh_attempted: bool,
    pub(crate) hello_attempted: bool,
    pub(crate) is_registered: bool,
    pub(crate) hub: Box<dyn HubTransport>,
    socket: Box<dyn TunnelSocket>,
    pub(crate) link: Box<dyn LinkMonitor>,
    pub(crate) clock: Arc<dyn Clock>,
    store: Option<StateStore>,
    store_loaded: bool,
    mux: StreamMux,
    pub(crate) hooks: Hooks,
    pub(crate) net_backoff: BackoffLadder,
    pub(crate) register_backoff: BackoffLadder,
    error_backoff: BackoffLadder,
    tunnel_backoff: StepLadder,
    pub(crate) next_net_action_ms: u64,
    pub(crate) next_register_action_ms: u64,
    next_tunnel_action_ms: u64,
    pub(crate) next_command_action_ms: u64,
    pub(crate) next_heartbeat_ms: u64,
    next_keepalive_ms: u64,
    socket_open: bool,
    tunnel_registered: bool,
    register_frame_sent: bool,
    pending_disconnect: bool,
    pub(crate) led_state: bool,
    last_error: String,
}

impl Agent {
    /// Production constructor: real clock, reqwest hub client, tungstenite
    /// socket, state file under the configured data dir.
    pub fn new(config: AgentConfig) -> Self {
        let store = StateStore::new(&config.storage.data_dir);
        let hub: Box<dyn HubTransport> = if config.missing_required().is_some() {
            Box::new(DisabledHub)
        } else {
            match HubClient::new(
                &config.hub.base_url,
                config.hub.allow_insecure_tls,
                config.hub.root_ca_pem.as_deref(),
            ) {
                Ok(client) => Box::new(client),
                Err(e) => {
                    warn!("Hub client unavailable: {e}");
                    Box::new(DisabledHub)
                }
            }
        };
        Self::with_parts(
            config,
            hub,
            Box::new(WsTransport::new()),
            Box::new(AlwaysUp),
            Arc::new(MonotonicClock::new()),
            store,
        )
    }

    /// Assemble an agent from explicit parts. This is the seam used by the
    /// test suite and by embedders with custom transports.
    pub fn with_parts(
        config: AgentConfig,
        hub: Box<dyn HubTransport>,
        socket: Box<dyn TunnelSocket>,
        link: Box<dyn LinkMonitor>,
        clock: Arc<dyn Clock>,
        store: Option<StateStore>,
    ) -> Self {
        let identity = NodeIdentity::derive(&config.identity);
        let register_floor = if config.registration.register_retry_ms > 0 {
            config.registration.register_retry_ms
        } else {
            1_000
        };
        let missing = config.missing_required();
        let is_registered = !config.registration.enable_node_registration;
        let max_body = config.tunnel.max_tunnel_body_bytes;
        let store_loaded = store.is_none();

        let mut agent = Self {
            config,
            identity,
            state: NodeState::Boot,
            fatal: false,
            creds: Credentials::new(),
            pairing: None,
            persisted_token: None,
            refresh_attempted: false,
            hello_attempted: false,
            is_registered,
            hub,
            socket,
            link,
            clock,
            store,
            store_loaded,
            mux: StreamMux::new(max_body),
            hooks: Hooks::default(),
            net_backoff: BackoffLadder::new(1_000, 30_000),
            register_backoff: BackoffLadder::new(register_floor, 30_000),
            error_backoff: BackoffLadder::new(2_000, 60_000),
            tunnel_backoff: StepLadder::new(&TUNNEL_SCHEDULE_MS),
            next_net_action_ms: 0,
            next_register_action_ms: 0,
            next_tunnel_action_ms: 0,
            next_command_action_ms: 0,
            next_heartbeat_ms: 0,
            next_keepalive_ms: 0,
            socket_open: false,
            tunnel_registered: false,
            register_frame_sent: false,
            pending_disconnect: false,
            led_state: false,
            last_error: String::new(),
        };

        if let Some(field) = missing {
            agent.fatal = true;
            agent.state = NodeState::Error;
            agent.set_last_error(&format!("config missing: {field}"));
        }
        agent
    }

    /// Install observer callbacks. A construction-time configuration error
    /// is surfaced immediately so the embedder does not miss it.
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
        if self.fatal && !self.last_error.is_empty() {
            if let Some(cb) = self.hooks.on_error.as_mut() {
                cb(&self.last_error);
            }
        }
    }

    /// Register the external request handler for tunnel streams.
    pub fn set_request_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.mux.set_handler(handler);
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn is_tunnel_connected(&self) -> bool {
        self.socket_open && self.tunnel_registered
    }

    pub fn node_id(&self) -> &str {
        self.creds.node_id()
    }

    pub fn node_auth_token(&self) -> &str {
        self.creds.node_auth_token()
    }

    pub fn tunnel_url(&self) -> &str {
        self.creds.tunnel_url()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    pub fn session_valid(&self) -> bool {
        self.creds.session_valid(self.clock.now_ms())
    }

    /// Drop the session credentials (token and expiry together).
    pub fn clear_session(&mut self) {
        self.creds.clear_session();
    }

    /// One scheduler pass. See the module docs for the ordering contract.
    pub async fn tick(&mut self) {
        if self.fatal {
            return;
        }
        let now = self.clock.now_ms();

        if !self.store_loaded {
            self.store_loaded = true;
            self.load_persisted().await;
        }

        let link_up = self.link.is_up();

        self.drain_socket_events(now).await;
        if self.pending_disconnect {
            self.finish_disconnect(now).await;
        }

        match self.state {
            NodeState::Error => {
                if link_up && now >= self.next_net_action_ms {
                    self.set_state(NodeState::Hello);
                    self.next_net_action_ms = now;
                }
                return;
            }
            NodeState::Boot => {
                if link_up {
                    if self.persisted_token.is_some() && !self.refresh_attempted {
                        self.refresh_session().await;
                    } else {
                        self.set_state(NodeState::Hello);
                        self.next_net_action_ms = now;
                    }
                }
                return;
            }
            _ => {}
        }

        // A dead session or a dead link invalidates the whole active family.
        if self.state.is_active_family() && (!self.creds.session_valid(now) || !link_up) {
            self.set_last_error("session expired or link lost");
            self.restart_hello(now, true, Some(0)).await;
            return;
        }

        if !link_up {
            return;
        }

        match self.state {
            NodeState::Hello => {
                if now >= self.next_net_action_ms {
                    self.send_hello().await;
                }
            }
            NodeState::PairSubmit => {
                if now >= self.next_net_action_ms {
                    self.submit_pairing().await;
                }
            }
            NodeState::PendingPoll => {
                if now >= self.next_net_action_ms {
                    self.poll_session().await;
                }
            }
            NodeState::Granted => {
                // Transient; completes within the call that entered it.
                self.activate_session(now);
            }
            s if s.is_active_family() => {
                self.process_active().await;
            }
            _ => {}
        }
    }

    /// Work performed while a session is live, each item on its own clock.
    async fn process_active(&mut self) {
        let now = self.clock.now_ms();
        self.register_node_if_needed(now).await;

        let now = self.clock.now_ms();
        if self.creds.has_session() && now >= self.next_heartbeat_ms {
            self.send_heartbeat().await;
            if !self.state.is_active_family() {
                return;
            }
        }

        let now = self.clock.now_ms();
        if self.config.session.enable_command_polling && now >= self.next_command_action_ms {
            self.pull_commands().await;
            if !self.state.is_active_family() {
                return;
            }
        }

        if self.config.tunnel.enable_tunnel {
            let now = self.clock.now_ms();
            self.maintain_tunnel(now).await;
        }
    }

    // ---- tunnel ----------------------------------------------------------

    async fn drain_socket_events(&mut self, now: u64) {
        loop {
            let Some(event) = self.socket.poll_event() else {
                break;
            };
            match event {
                SocketEvent::Text(text) => self.on_tunnel_text(&text, now).await,
                SocketEvent::Disconnected => {
                    // Teardown is deferred to keep the event path allocation-
                    // and deallocation-free.
                    self.pending_disconnect = true;
                }
            }
        }
    }

    async fn on_tunnel_text(&mut self, text: &str, now: u64) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.set_last_error("tunnel frame is not valid JSON");
                return;
            }
        };

        if frame["type"].as_str() == Some("register_ack")
            || frame["action"].as_str() == Some("register_ack")
        {
            self.handle_register_ack(&frame, now).await;
            return;
        }
        if frame["type"].as_str() == Some("pong") {
            return;
        }

        let uptime = now;
        let node_id = self.creds.node_id().to_string();
        let replies = self.mux.handle_frame(&frame, uptime, &node_id);
        for reply in replies {
            if let Err(e) = self.socket.send_text(&reply).await {
                self.set_last_error(&format!("tunnel send: {e}"));
                self.pending_disconnect = true;
                return;
            }
        }
    }

    async fn handle_register_ack(&mut self, frame: &Value, now: u64) {
        let status = frame["status"].as_str().unwrap_or("");
        if status == "ok" || status == "registered" {
            info!("Tunnel registered with hub");
            self.tunnel_registered = true;
            self.tunnel_backoff.reset();
            self.next_keepalive_ms = now + KEEPALIVE_INTERVAL_MS;
            self.set_state(NodeState::TunnelConnected);
            if let Some(cb) = self.hooks.on_tunnel.as_mut() {
                cb(true);
            }
            return;
        }

        let reason = frame["reason"].as_str().unwrap_or("unknown");
        self.set_last_error(&format!("tunnel register rejected: {reason}"));
        match reason {
            // The hub no longer accepts our token: re-authenticate.
            "MISSING_AUTH_TOKEN" | "SESSION_TOKEN_MISSING_SLOT_ID" => {
                self.restart_hello(now, true, None).await;
            }
            // Recoverable (e.g. SLOT_ID_MISMATCH after a hub migration):
            // drop the socket and retry on the ladder.
            _ => {
                self.pending_disconnect = true;
            }
        }
    }

    /// Deferred teardown: runs on the tick after a disconnect was observed.
    async fn finish_disconnect(&mut self, now: u64) {
        self.pending_disconnect = false;
        let was_open = self.socket_open;
        self.socket.close().await;
        self.socket_open = false;
        self.tunnel_registered = false;
        self.register_frame_sent = false;
        self.mux.reset();

        let delay = self.next_tunnel_delay();
        self.next_tunnel_action_ms = now + delay;

        if matches!(
            self.state,
            NodeState::TunnelConnecting | NodeState::TunnelConnected
        ) {
            self.set_state(NodeState::Active);
        }
        if was_open {
            debug!("Tunnel down, next attempt in {delay} ms");
            if let Some(cb) = self.hooks.on_tunnel.as_mut() {
                cb(false);
            }
        }
    }

    fn next_tunnel_delay(&mut self) -> u64 {
        if self.config.tunnel.tunnel_reconnect_ms > 0 {
            self.config.tunnel.tunnel_reconnect_ms
        } else {
            self.tunnel_backoff.next_delay()
        }
    }

    async fn maintain_tunnel(&mut self, now: u64) {
        if !self.socket_open {
            if now < self.next_tunnel_action_ms {
                return;
            }
            let url = self.tunnel_ws_url();
            let bearer = self.creds.session_token().to_string();
            self.set_state(NodeState::TunnelConnecting);
            debug!("Tunnel connecting to {url}");
            match self.socket.connect(&url, &bearer).await {
                Ok(()) => {
                    self.socket_open = true;
                    self.send_register_frame().await;
                }
                Err(e) => {
                    self.set_last_error(&format!("tunnel connect: {e}"));
                    let now = self.clock.now_ms();
                    let delay = self.next_tunnel_delay();
                    self.next_tunnel_action_ms = now + delay;
                    self.set_state(NodeState::Active);
                }
            }
        } else if self.tunnel_registered && now >= self.next_keepalive_ms {
            if let Err(e) = self.socket.send_text(r#"{"type":"ping"}"#).await {
                self.set_last_error(&format!("tunnel keepalive: {e}"));
                self.pending_disconnect = true;
            } else {
                self.next_keepalive_ms = now + KEEPALIVE_INTERVAL_MS;
            }
        }
    }

    /// The register frame, sent exactly once per WebSocket lifetime.
    async fn send_register_frame(&mut self) {
        if self.register_frame_sent {
            return;
        }
        let frame = serde_json::json!({
            "action": "register",
            "node_id": self.creds.node_id(),
            "slot_id": self.config.hub.slot_id,
            "machine_id": self.identity.machine_id,
            "version": self.identity.firmware_version,
            "platform": identity::PLATFORM,
            "timestamp": self.clock.now_ms(),
        });
        match self.socket.send_text(&frame.to_string()).await {
            Ok(()) => self.register_frame_sent = true,
            Err(e) => {
                self.set_last_error(&format!("tunnel register frame: {e}"));
                self.pending_disconnect = true;
            }
        }
    }

    /// Tunnel endpoint: the server-provided URL when one exists, otherwise
    /// derived from the hub base URL.
    fn tunnel_ws_url(&self) -> String {
        if !self.creds.tunnel_url().is_empty() {
            return self.creds.tunnel_url().to_string();
        }
        let base = self.config.hub.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{base}")
        };
        format!("{}{}", ws_base, self.config.tunnel.ws_tunnel_path)
    }

    // ---- shared plumbing -------------------------------------------------

    pub(crate) fn set_state(&mut self, new: NodeState) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        debug!("State {old:?} -> {new:?}");
        if let Some(cb) = self.hooks.on_state_change.as_mut() {
            cb(old, new);
        }
    }

    pub(crate) fn set_last_error(&mut self, msg: &str) {
        let mut end = msg.len().min(MAX_LAST_ERROR);
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        let truncated = &msg[..end];
        if truncated != self.last_error {
            warn!("{truncated}");
            self.last_error = truncated.to_string();
            if let Some(cb) = self.hooks.on_error.as_mut() {
                cb(&self.last_error);
            }
        }
    }

    pub(crate) fn clear_last_error(&mut self) {
        self.last_error.clear();
    }

    /// Schedule the next attempt of the current hub action on the net ladder.
    pub(crate) fn schedule_net_retry(&mut self, now: u64) {
        self.next_net_action_ms = now + self.net_backoff.next_delay();
    }

    /// Abandon the session (optionally) and return to HELLO.
    ///
    /// `delay_ms`: `None` schedules on the net ladder, `Some(d)` schedules
    /// exactly `d` ms out.
    pub(crate) async fn restart_hello(&mut self, now: u64, drop_session: bool, delay_ms: Option<u64>) {
        if drop_session && self.creds.has_session() {
            self.creds.clear_session();
            if let Some(cb) = self.hooks.on_session_invalid.as_mut() {
                cb();
            }
            self.persist(now).await;
        }
        if self.socket_open || self.pending_disconnect {
            self.finish_disconnect(now).await;
        }
        self.set_state(NodeState::Hello);
        match delay_ms {
            Some(delay) => self.next_net_action_ms = now + delay,
            None => self.schedule_net_retry(now),
        }
    }

    /// Enter ERROR and schedule the HELLO retry that eventually leaves it.
    pub(crate) async fn enter_error(&mut self, now: u64, msg: &str) {
        self.set_last_error(msg);
        if self.creds.has_session() {
            self.creds.clear_session();
            if let Some(cb) = self.hooks.on_session_invalid.as_mut() {
                cb();
            }
            self.persist(now).await;
        }
        if self.socket_open || self.pending_disconnect {
            self.finish_disconnect(now).await;
        }
        self.set_state(NodeState::Error);
        self.next_net_action_ms = now + self.error_backoff.next_delay();
    }

    /// Complete a session grant: reset ladders, start the heartbeat and
    /// command clocks, and land in ACTIVE.
    pub(crate) fn activate_session(&mut self, now: u64) {
        self.net_backoff.reset();
        self.error_backoff.reset();
        self.next_heartbeat_ms = now;
        self.next_command_action_ms = now + self.command_interval();
        self.clear_last_error();
        self.set_state(NodeState::Active);
    }

    pub(crate) fn command_interval(&self) -> u64 {
        if self.config.session.command_poll_interval_ms > 0 {
            self.config.session.command_poll_interval_ms
        } else {
            self.config.session.heartbeat_interval_ms
        }
    }

    // ---- persistence -----------------------------------------------------

    async fn load_persisted(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(state) = store.load().await else {
            return;
        };
        if !state.node_id.is_empty() && !state.node_auth_token.is_empty() {
            self.creds
                .set_registration(&state.node_id, &state.node_auth_token, &state.tunnel_url);
            self.is_registered = true;
        } else if !state.tunnel_url.is_empty() {
            self.creds.set_tunnel_url(&state.tunnel_url);
        }
        if !state.session_token.is_empty() {
            debug!("Recovered persisted session token, will attempt refresh");
            self.persisted_token = Some(state.session_token);
        }
    }

    pub(crate) async fn persist(&mut self, now: u64) {
        let Some(store) = &self.store else {
            return;
        };
        let expires_at = if self.creds.session_expires_at_ms() == 0 {
            None
        } else {
            let remaining = self.creds.session_expires_at_ms().saturating_sub(now);
            chrono::Duration::try_milliseconds(i64::try_from(remaining).unwrap_or(0))
                .map(|d| chrono::Utc::now() + d)
        };
        let state = PersistedState {
            session_token: self.creds.session_token().to_string(),
            session_expires_at: expires_at,
            node_id: self.creds.node_id().to_string(),
            node_auth_token: self.creds.node_auth_token().to_string(),
            tunnel_url: self.creds.tunnel_url().to_string(),
        };
        store.save(&state).await;
    }

    /// One-shot refresh of a persisted session at boot. GRANTED skips the
    /// HELLO flow entirely.
    async fn refresh_session(&mut self) {
        self.refresh_attempted = true;
        let Some(token) = self.persisted_token.take() else {
            return;
        };
        let body = serde_json::json!({
            "slot_id": self.config.hub.slot_id,
            "nonce": identity::create_nonce(),
            "session_token": token.as_str(),
        });
        let path = self.config.session.session_endpoint_path.clone();
        let result = self.hub.post_json(&path, &body, None, &[]).await;
        let now = self.clock.now_ms();
        match result {
            Ok(response) if response.status == 401 || response.status == 403 || response.status == 410 => {
                self.set_last_error("persisted session rejected");
                self.persist(now).await;
                self.set_state(NodeState::Hello);
                self.next_net_action_ms = now;
            }
            Ok(response)
                if response.is_success()
                    && response.body["status"].as_str() == Some("GRANTED") =>
            {
                let new_token = response.body["session_token"].as_str().unwrap_or(&token);
                let ttl = response.body["ttl_seconds"].as_u64().unwrap_or(3600);
                self.creds.set_session(new_token, now + ttl * 1_000);
                if let Some(url) = response.body["tunnel_url"].as_str() {
                    self.creds.set_tunnel_url(url);
                }
                info!("Session refreshed from persisted token");
                self.set_state(NodeState::Granted);
                self.persist(now).await;
                self.activate_session(now);
            }
            Ok(_) | Err(_) => {
                debug!("Session refresh inconclusive, falling back to HELLO");
                self.set_state(NodeState::Hello);
                self.next_net_action_ms = now;
            }
        }
    }

    /// Close the socket and persist state; called by the embedder on shutdown.
    pub async fn shutdown(&mut self) {
        let now = self.clock.now_ms();
        if self.socket_open {
            self.socket.close().await;
            self.socket_open = false;
        }
        self.persist(now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{rig_agent, rig_agent_with_store, test_config};
    use serde_json::json;

    fn script_activation(rig: &crate::testutil::Rig, ttl_seconds: u64) {
        let mut hub = rig.hub.lock().unwrap();
        hub.push_ok(200, json!({"status": "PENDING", "retry_after_ms": 0}));
        hub.push_ok(
            200,
            json!({"status": "GRANTED", "session_token": "TOK", "ttl_seconds": ttl_seconds}),
        );
    }

    /// Drive Boot → Hello → PendingPoll → Active with the scripts above.
    async fn activate(agent: &mut Agent) {
        agent.tick().await; // Boot -> Hello
        agent.tick().await; // HELLO -> PendingPoll
        agent.tick().await; // poll -> Active
        assert_eq!(agent.state(), NodeState::Active);
    }

    #[tokio::test]
    async fn test_hello_pending_granted() {
        let (mut agent, rig) = rig_agent(test_config());
        script_activation(&rig, 60);

        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Hello);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::PendingPoll);
        agent.tick().await; // retry_after_ms = 0, poll due immediately
        assert_eq!(agent.state(), NodeState::Active);

        assert_eq!(agent.credentials().session_token(), "TOK");
        assert_eq!(agent.credentials().session_expires_at_ms(), 60_000);
        assert!(agent.session_valid());

        let transitions = rig.transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![
                (NodeState::Boot, NodeState::Hello),
                (NodeState::Hello, NodeState::PendingPoll),
                (NodeState::PendingPoll, NodeState::Granted),
                (NodeState::Granted, NodeState::Active),
            ]
        );

        let hub = rig.hub.lock().unwrap();
        assert_eq!(hub.requests[0].path, "/api/device/hello");
        assert_eq!(hub.requests[1].path, "/api/device/session");
        assert_eq!(hub.requests[0].body["slot_id"], "slot-1");
        assert!(hub.requests[0].body["nonce"].as_str().is_some());
        assert!(hub.requests[0].body["capabilities_hash"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_retry_after_ms_is_honored() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"status": "PENDING", "retry_after_ms": 100}));
            hub.push_ok(
                200,
                json!({"status": "GRANTED", "session_token": "TOK", "ttl_seconds": 60}),
            );
        }
        agent.tick().await;
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::PendingPoll);

        // Not yet due.
        rig.advance(99);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::PendingPoll);
        assert_eq!(rig.hub.lock().unwrap().requests.len(), 1);

        rig.advance(1);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Active);
    }

    #[tokio::test]
    async fn test_hello_denied_stays_hello() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"status": "DENIED"}));
            hub.push_ok(200, json!({"status": "DENIED"}));
        }

        agent.tick().await; // Boot -> Hello
        agent.tick().await; // first DENIED
        assert_eq!(agent.state(), NodeState::Hello);

        rig.advance(1_000); // net ladder floor
        agent.tick().await; // second DENIED
        assert_eq!(agent.state(), NodeState::Hello);

        // Only session-poll DENIED is terminal.
        assert_ne!(agent.state(), NodeState::Error);
        let transitions = rig.transitions.lock().unwrap();
        assert_eq!(*transitions, vec![(NodeState::Boot, NodeState::Hello)]);

        // The repeated identical message fires on_error once.
        let errors = rig.errors.lock().unwrap();
        assert_eq!(
            errors.iter().filter(|e| e.contains("HELLO denied")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_session_denied_enters_error_then_recovers() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"status": "PENDING", "retry_after_ms": 0}));
            hub.push_ok(200, json!({"status": "DENIED"}));
            hub.push_ok(200, json!({"status": "PENDING", "retry_after_ms": 0}));
        }

        agent.tick().await;
        agent.tick().await;
        agent.tick().await; // poll DENIED
        assert_eq!(agent.state(), NodeState::Error);

        // ERROR self-loops until the timer fires, then resumes HELLO.
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Error);
        rig.advance(2_000);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Hello);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::PendingPoll);
    }

    #[tokio::test]
    async fn test_hello_with_pairing_code_pairs() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(
                200,
                json!({"status": "PENDING", "pairing_code": "ZX42", "pairing_expires_at": "2026-01-01T00:00:00Z"}),
            );
            hub.push_ok(
                200,
                json!({"ok": true, "node_id": "n-7", "session_token": "PTOK", "tunnel_url": "wss://hub.test/ws/tunnel"}),
            );
        }

        agent.tick().await;
        agent.tick().await; // HELLO -> PairSubmit
        assert_eq!(agent.state(), NodeState::PairSubmit);
        agent.tick().await; // pair 2xx -> Active
        assert_eq!(agent.state(), NodeState::Active);
        assert_eq!(agent.credentials().session_token(), "PTOK");
        assert_eq!(agent.node_id(), "n-7");
        assert_eq!(agent.tunnel_url(), "wss://hub.test/ws/tunnel");

        let hub = rig.hub.lock().unwrap();
        assert_eq!(hub.requests[1].path, "/api/device/pair");
        assert_eq!(hub.requests[1].body["pairing_code"], "ZX42");
    }

    #[tokio::test]
    async fn test_pair_gone_resumes_hello() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"status": "PENDING", "pairing_code": "ZX42"}));
            hub.push_ok(410, json!({"error": "pairing expired"}));
        }

        agent.tick().await;
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::PairSubmit);
        agent.tick().await; // 410
        assert_eq!(agent.state(), NodeState::Hello);
    }

    #[tokio::test]
    async fn test_self_approve_uses_approve_endpoint() {
        let mut config = test_config();
        config.session.enable_self_approve = true;
        let (mut agent, rig) = rig_agent(config);
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"status": "PENDING", "pairing_code": "ZX42"}));
            hub.push_ok(
                200,
                json!({"status": "APPROVED", "session_token": "ATOK", "node_id": "n-2", "register_token": "RT"}),
            );
        }

        agent.tick().await;
        agent.tick().await;
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Active);
        assert_eq!(agent.credentials().session_token(), "ATOK");
        assert_eq!(agent.node_auth_token(), "RT");

        let hub = rig.hub.lock().unwrap();
        assert_eq!(hub.requests[1].path, "/api/device/approve");
        assert!(hub.requests[1].body["mac"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_extends_ttl() {
        let mut config = test_config();
        config.session.blink_on_heartbeat = true;
        let (mut agent, rig) = rig_agent(config);
        script_activation(&rig, 60);
        rig.hub
            .lock()
            .unwrap()
            .push_ok(200, json!({"ttl_seconds": 120}));

        activate(&mut agent).await;
        agent.tick().await; // first heartbeat fires immediately

        assert_eq!(agent.credentials().session_expires_at_ms(), 120_000);
        let hub = rig.hub.lock().unwrap();
        let hb = &hub.requests[2];
        assert_eq!(hb.path, "/api/device/heartbeat");
        assert_eq!(hb.bearer.as_deref(), Some("TOK"));
        assert_eq!(hb.body["slot_id"], "slot-1");
        assert_eq!(hb.body["rssi"], -61);
        assert_eq!(hb.body["led_state"], false);
    }

    #[tokio::test]
    async fn test_heartbeat_auth_failure_clears_session() {
        let (mut agent, rig) = rig_agent(test_config());
        script_activation(&rig, 60);
        rig.hub.lock().unwrap().push_ok(401, json!({}));

        activate(&mut agent).await;
        agent.tick().await; // heartbeat 401

        assert_eq!(agent.state(), NodeState::Hello);
        assert!(!agent.credentials().has_session());
        assert_eq!(agent.credentials().session_expires_at_ms(), 0);
        assert_eq!(rig.session_invalid.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_command_pull_acks_each_command() {
        let mut config = test_config();
        config.session.enable_command_polling = true;
        config.session.command_poll_interval_ms = 500;
        let (mut agent, rig) = rig_agent(config);
        script_activation(&rig, 1_000_000);
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({})); // heartbeat
            hub.push_ok(200, json!({"commands": [{"id": "c1", "action": "noop"}]}));
            hub.push_ok(200, json!({})); // ack
        }

        activate(&mut agent).await;
        agent.tick().await; // heartbeat
        rig.advance(500);
        agent.tick().await; // command pull + ack

        let hub = rig.hub.lock().unwrap();
        let acks: Vec<_> = hub
            .requests
            .iter()
            .filter(|r| r.path == "/api/device/commands/ack")
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].body["command_id"], "c1");
        assert_eq!(acks[0].body["status"], "handled");
        assert_eq!(acks[0].bearer.as_deref(), Some("TOK"));
        assert_eq!(
            *rig.commands.lock().unwrap(),
            vec![("c1".to_string(), "noop".to_string())]
        );
    }

    #[tokio::test]
    async fn test_link_loss_restarts_hello() {
        let (mut agent, rig) = rig_agent(test_config());
        script_activation(&rig, 1_000_000);
        activate(&mut agent).await;

        rig.link.store(false, std::sync::atomic::Ordering::Relaxed);
        agent.tick().await;

        assert_eq!(agent.state(), NodeState::Hello);
        assert!(!agent.credentials().has_session());
    }

    #[tokio::test]
    async fn test_config_missing_is_permanent_error() {
        let mut config = test_config();
        config.hub.base_url = String::new();
        let (mut agent, rig) = rig_agent(config);

        assert_eq!(agent.state(), NodeState::Error);
        assert!(agent.last_error().contains("hub.base_url"));
        // set_hooks re-surfaced the construction-time error.
        assert!(rig
            .errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("hub.base_url")));

        for _ in 0..5 {
            rig.advance(120_000);
            agent.tick().await;
        }
        assert_eq!(agent.state(), NodeState::Error);
        assert!(rig.hub.lock().unwrap().requests.is_empty());
    }

    // ---- tunnel ----------------------------------------------------------

    fn tunnel_config() -> AgentConfig {
        let mut config = test_config();
        config.tunnel.enable_tunnel = true;
        // Keep the heartbeat out of the way once the first one has fired.
        config.session.heartbeat_interval_ms = 10_000_000;
        config
    }

    async fn activate_with_tunnel(agent: &mut Agent, rig: &crate::testutil::Rig) {
        script_activation(rig, 1_000_000);
        rig.hub.lock().unwrap().push_ok(200, json!({})); // first heartbeat
        activate(agent).await;
        agent.tick().await; // heartbeat + first tunnel connect
        assert_eq!(agent.state(), NodeState::TunnelConnecting);
        assert_eq!(rig.socket.lock().unwrap().connects.len(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_connect_sends_register_frame() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        let socket = rig.socket.lock().unwrap();
        let (url, bearer) = &socket.connects[0];
        assert_eq!(url, "ws://hub.test/ws/tunnel");
        assert_eq!(bearer, "TOK");

        let frame: serde_json::Value = serde_json::from_str(&socket.sent[0]).unwrap();
        assert_eq!(frame["action"], "register");
        assert_eq!(frame["slot_id"], "slot-1");
        assert_eq!(frame["machine_id"], "node-test");
        assert_eq!(frame["platform"], "linux");
    }

    #[tokio::test]
    async fn test_register_ack_connects_and_keepalive() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "register_ack", "status": "ok"}).to_string(),
        ));
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::TunnelConnected);
        assert!(agent.is_tunnel_connected());
        assert_eq!(*rig.tunnel_events.lock().unwrap(), vec![true]);

        rig.advance(25_000);
        agent.tick().await;
        let socket = rig.socket.lock().unwrap();
        assert!(socket.sent.iter().any(|s| s == r#"{"type":"ping"}"#));
    }

    #[tokio::test]
    async fn test_register_ack_auth_failure_clears_session() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "register_ack", "status": "error", "reason": "MISSING_AUTH_TOKEN"})
                .to_string(),
        ));
        agent.tick().await;

        assert_eq!(agent.state(), NodeState::Hello);
        assert!(!agent.credentials().has_session());
        assert!(agent.last_error().contains("MISSING_AUTH_TOKEN"));
    }

    #[tokio::test]
    async fn test_register_ack_mismatch_backs_off() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "register_ack", "status": "error", "reason": "SLOT_ID_MISMATCH"})
                .to_string(),
        ));
        agent.tick().await;

        // Session survives; the socket is torn down and rescheduled.
        assert!(agent.credentials().has_session());
        assert_eq!(agent.state(), NodeState::Active);
        assert_eq!(rig.socket.lock().unwrap().close_count, 1);
    }

    #[tokio::test]
    async fn test_reconnect_follows_discrete_ladder() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        // Five immediate disconnects; the gaps must follow the schedule, and
        // the schedule saturates at its last step.
        for (i, expected_gap) in [2_000u64, 4_000, 8_000, 15_000, 60_000, 60_000]
            .iter()
            .enumerate()
        {
            rig.push_event(crate::tunnel::SocketEvent::Disconnected);
            agent.tick().await; // deferred teardown + schedule
            assert_eq!(agent.state(), NodeState::Active);

            rig.advance(expected_gap - 1);
            agent.tick().await;
            assert_eq!(
                rig.socket.lock().unwrap().connects.len(),
                i + 1,
                "connected too early at step {i}"
            );

            rig.advance(1);
            agent.tick().await;
            assert_eq!(
                rig.socket.lock().unwrap().connects.len(),
                i + 2,
                "missed reconnect at step {i}"
            );
        }
    }

    #[tokio::test]
    async fn test_ladder_resets_after_register_ack() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;

        // Two failures advance the ladder...
        for gap in [2_000u64, 4_000] {
            rig.push_event(crate::tunnel::SocketEvent::Disconnected);
            agent.tick().await;
            rig.advance(gap);
            agent.tick().await;
        }
        // ...then a successful registration resets it.
        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "register_ack", "status": "ok"}).to_string(),
        ));
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::TunnelConnected);

        rig.push_event(crate::tunnel::SocketEvent::Disconnected);
        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Active);

        rig.advance(2_000);
        agent.tick().await;
        let connects = rig.socket.lock().unwrap().connects.len();
        assert_eq!(connects, 4, "reset ladder should reconnect after 2 s");
    }

    #[tokio::test]
    async fn test_envelope_request_answered_through_socket() {
        let (mut agent, rig) = rig_agent(tunnel_config());
        activate_with_tunnel(&mut agent, &rig).await;
        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "register_ack", "status": "ok"}).to_string(),
        ));
        agent.tick().await;

        rig.push_event(crate::tunnel::SocketEvent::Text(
            json!({"type": "HTTP_REQ", "stream_id": "q1", "method": "GET", "path": "/ping"})
                .to_string(),
        ));
        agent.tick().await;

        let socket = rig.socket.lock().unwrap();
        let response: serde_json::Value =
            serde_json::from_str(socket.sent.last().unwrap()).unwrap();
        assert_eq!(response["type"], "HTTP_RES");
        assert_eq!(response["stream_id"], "q1");
        assert_eq!(response["status"], 200);
    }

    // ---- registration ----------------------------------------------------

    #[tokio::test]
    async fn test_registers_by_slot_once_active() {
        let mut config = test_config();
        config.registration.enable_node_registration = true;
        config.registration.login_token = "LT".to_string();
        let (mut agent, rig) = rig_agent(config);
        script_activation(&rig, 1_000_000);
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(
                201,
                json!({"node_id": "n-1", "node_auth_token": "AUTH", "tunnel_url": "wss://hub.test/ws/tunnel"}),
            );
            hub.push_ok(200, json!({})); // heartbeat
        }

        assert!(!agent.is_registered());
        activate(&mut agent).await;
        agent.tick().await; // registration + heartbeat

        assert!(agent.is_registered());
        assert_eq!(agent.node_id(), "n-1");
        assert_eq!(agent.node_auth_token(), "AUTH");
        assert_eq!(*rig.registered.lock().unwrap(), vec!["n-1".to_string()]);

        let hub = rig.hub.lock().unwrap();
        let reg = hub
            .requests
            .iter()
            .find(|r| r.path == "/api/nodes/register_by_slot")
            .unwrap();
        assert_eq!(reg.body["login_token"], "LT");
        assert_eq!(reg.body["machine_id"], "node-test");
    }

    #[tokio::test]
    async fn test_register_by_pairing_sends_internal_key() {
        let mut config = test_config();
        config.registration.enable_node_registration = true;
        config.registration.pairing_code = "PC-1".to_string();
        config.registration.internal_key = "IK".to_string();
        config.registration.prefer_register_by_slot = false;
        let (mut agent, rig) = rig_agent(config);
        script_activation(&rig, 1_000_000);
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"node_id": "n-3", "node_auth_token": "A3"}));
            hub.push_ok(200, json!({})); // heartbeat
        }

        activate(&mut agent).await;
        agent.tick().await;

        assert!(agent.is_registered());
        let hub = rig.hub.lock().unwrap();
        let reg = hub
            .requests
            .iter()
            .find(|r| r.path == "/api/nodes/register")
            .unwrap();
        assert_eq!(reg.body["pairing_code"], "PC-1");
        assert!(reg
            .headers
            .iter()
            .any(|(k, v)| k == "X-Internal-Key" && v == "IK"));
    }

    #[tokio::test]
    async fn test_registration_idempotent() {
        let (mut agent, rig) = rig_agent(test_config());
        let response = json!({"node_id": "n-1", "node_auth_token": "AUTH", "tunnel_url": "wss://t"});
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, response.clone());
            hub.push_ok(200, response);
        }

        assert!(agent.register_by_slot().await);
        let snapshot = agent.credentials().clone();
        assert!(agent.register_by_slot().await);
        assert_eq!(*agent.credentials(), snapshot);
    }

    #[tokio::test]
    async fn test_registration_failure_keeps_credentials() {
        let (mut agent, rig) = rig_agent(test_config());
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(200, json!({"node_id": "n-1", "node_auth_token": "AUTH"}));
            hub.push_ok(500, json!({"error": "boom"}));
        }

        assert!(agent.register_by_slot().await);
        let snapshot = agent.credentials().clone();
        assert!(!agent.register_by_slot().await);
        assert_eq!(*agent.credentials(), snapshot);
    }

    // ---- persistence / refresh -------------------------------------------

    #[tokio::test]
    async fn test_refresh_granted_skips_hello() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::StateStore::new(dir.path().to_str().unwrap()).unwrap();
        store
            .save(&crate::store::PersistedState {
                session_token: "OLD".to_string(),
                session_expires_at: None,
                node_id: "n-1".to_string(),
                node_auth_token: "AUTH".to_string(),
                tunnel_url: String::new(),
            })
            .await;

        let store = crate::store::StateStore::new(dir.path().to_str().unwrap());
        let (mut agent, rig) = rig_agent_with_store(test_config(), store);
        rig.hub.lock().unwrap().push_ok(
            200,
            json!({"status": "GRANTED", "session_token": "NEW", "ttl_seconds": 60}),
        );

        agent.tick().await;
        assert_eq!(agent.state(), NodeState::Active);
        assert_eq!(agent.credentials().session_token(), "NEW");
        assert_eq!(agent.node_id(), "n-1");

        let hub = rig.hub.lock().unwrap();
        assert_eq!(hub.requests.len(), 1);
        assert_eq!(hub.requests[0].path, "/api/device/session");
        assert_eq!(hub.requests[0].body["session_token"], "OLD");
    }

    #[tokio::test]
    async fn test_refresh_rejected_falls_back_to_hello() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::StateStore::new(dir.path().to_str().unwrap()).unwrap();
        store
            .save(&crate::store::PersistedState {
                session_token: "STALE".to_string(),
                ..Default::default()
            })
            .await;

        let store = crate::store::StateStore::new(dir.path().to_str().unwrap());
        let (mut agent, rig) = rig_agent_with_store(test_config(), store);
        {
            let mut hub = rig.hub.lock().unwrap();
            hub.push_ok(401, json!({}));
            hub.push_ok(200, json!({"status": "PENDING", "retry_after_ms": 0}));
        }

        agent.tick().await; // refresh rejected -> Hello
        assert_eq!(agent.state(), NodeState::Hello);
        agent.tick().await; // HELLO proceeds normally
        assert_eq!(agent.state(), NodeState::PendingPoll);

        // The stale token is gone from disk too.
        let reloaded = crate::store::StateStore::new(dir.path().to_str().unwrap())
            .unwrap()
            .load()
            .await
            .unwrap();
        assert!(reloaded.session_token.is_empty());
    }
}
