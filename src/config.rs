//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `EDGELINK_HUB_URL`, `EDGELINK_SLOT_ID`,
//!    `EDGELINK_LOGIN_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `edgelink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! tick_interval_ms = 100
//!
//! [hub]
//! base_url = "https://hub.example.com"
//! slot_id = "slot-42"
//! allow_insecure_tls = false
//! # root_ca_pem = "-----BEGIN CERTIFICATE-----\n..."
//!
//! [identity]
//! firmware_version = "0.3.1"
//! capabilities = ["gpio", "sensor"]     # ordered — the hash is order-sensitive
//! machine_id_prefix = "node-"
//! node_name_prefix = "Node-"
//!
//! [session]
//! heartbeat_interval_ms = 60000
//! enable_command_polling = false
//!
//! [registration]
//! enable_node_registration = true
//! login_token = "tok"
//! prefer_register_by_slot = true
//!
//! [tunnel]
//! enable_tunnel = true
//! ws_tunnel_path = "/ws/tunnel"
//! max_tunnel_body_bytes = 4096
//!
//! [storage]
//! data_dir = "/var/lib/edgelink"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Milliseconds between `tick()` calls in the driver loop (default 100).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hub endpoint and TLS policy. Immutable after construction.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub base URL, e.g. `https://hub.example.com`. Required.
    #[serde(default)]
    pub base_url: String,
    /// Provisioning slot this device claims. Required.
    #[serde(default)]
    pub slot_id: String,
    /// Skip TLS verification entirely (default false).
    #[serde(default)]
    pub allow_insecure_tls: bool,
    /// PEM bundle to pin as the sole trust anchor. When absent and
    /// `allow_insecure_tls` is false, verification degrades to insecure with
    /// a logged warning.
    pub root_ca_pem: Option<String>,
}

/// Device identity knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Reported firmware/agent version (default crate version).
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    /// Ordered capability list; the advertised hash is order-sensitive.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Explicit machine id. When empty one is derived from prefix + suffix.
    #[serde(default)]
    pub machine_id: String,
    /// Explicit node display name. When empty one is derived.
    #[serde(default)]
    pub node_name: String,
    /// Prefix for derived machine ids (default `node-`).
    #[serde(default = "default_machine_id_prefix")]
    pub machine_id_prefix: String,
    /// Prefix for derived node names (default `Node-`).
    #[serde(default = "default_node_name_prefix")]
    pub node_name_prefix: String,
    /// Append a unique suffix to derived ids (default true).
    #[serde(default = "default_true")]
    pub append_unique_suffix: bool,
    /// Derive the suffix from the first interface MAC (default true);
    /// falls back to a hostname hash.
    #[serde(default = "default_true")]
    pub use_mac_for_unique_id: bool,
}

/// Session lifecycle intervals and paths.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Milliseconds between heartbeats (default 60 000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Poll `/api/device/commands/pull` (default false).
    #[serde(default)]
    pub enable_command_polling: bool,
    /// Command poll interval; 0 falls back to the heartbeat interval.
    #[serde(default)]
    pub command_poll_interval_ms: u64,
    /// Session endpoint path (default `/api/device/session`).
    #[serde(default = "default_session_endpoint_path")]
    pub session_endpoint_path: String,
    /// Use the self-approve flow instead of pair submission (default false).
    #[serde(default)]
    pub enable_self_approve: bool,
    /// Approve endpoint path (default `/api/device/approve`).
    #[serde(default = "default_approve_endpoint_path")]
    pub approve_endpoint_path: String,
    /// Retry interval for approve submissions; 0 uses the net backoff ladder.
    #[serde(default)]
    pub approve_retry_ms: u64,
    /// Include `reconnect: true` and a boot reason in HELLO after the first
    /// attempt (default false).
    #[serde(default)]
    pub send_reconnect_hint_in_hello: bool,
    /// Toggle the status indicator on each successful heartbeat
    /// (default false).
    #[serde(default)]
    pub blink_on_heartbeat: bool,
}

/// Node registration flows.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// Attempt node registration once a session is active (default false).
    #[serde(default)]
    pub enable_node_registration: bool,
    /// Operator login token for register-by-slot.
    #[serde(default)]
    pub login_token: String,
    /// Static pairing code for register-by-pairing.
    #[serde(default)]
    pub pairing_code: String,
    /// Value for the `X-Internal-Key` header on register-by-pairing.
    #[serde(default)]
    pub internal_key: String,
    /// Initial register retry delay; 0 uses the ladder floor (1 s).
    #[serde(default)]
    pub register_retry_ms: u64,
    /// Try register-by-slot before register-by-pairing (default true).
    #[serde(default = "default_true")]
    pub prefer_register_by_slot: bool,
}

/// Tunnel transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Maintain the upstream WebSocket tunnel (default true).
    #[serde(default = "default_true")]
    pub enable_tunnel: bool,
    /// Path appended to the hub host when no server-provided tunnel URL
    /// exists (default `/ws/tunnel`).
    #[serde(default = "default_ws_tunnel_path")]
    pub ws_tunnel_path: String,
    /// Cap on a reassembled inbound request (default 4096 bytes). Exceeding
    /// it yields a 413 and closes the stream.
    #[serde(default = "default_max_tunnel_body_bytes")]
    pub max_tunnel_body_bytes: usize,
    /// Fixed reconnect delay in ms; 0 uses the `{2,4,8,15,60}` s schedule.
    #[serde(default)]
    pub tunnel_reconnect_ms: u64,
}

/// Persistence location.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for the credential state file (default `/var/lib/edgelink`).
    /// Empty disables persistence.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_machine_id_prefix() -> String {
    "node-".to_string()
}
fn default_node_name_prefix() -> String {
    "Node-".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    60_000
}
fn default_session_endpoint_path() -> String {
    "/api/device/session".to_string()
}
fn default_approve_endpoint_path() -> String {
    "/api/device/approve".to_string()
}
fn default_ws_tunnel_path() -> String {
    "/ws/tunnel".to_string()
}
fn default_max_tunnel_body_bytes() -> usize {
    4096
}
fn default_data_dir() -> String {
    "/var/lib/edgelink".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            slot_id: String::new(),
            allow_insecure_tls: false,
            root_ca_pem: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            firmware_version: default_firmware_version(),
            capabilities: Vec::new(),
            machine_id: String::new(),
            node_name: String::new(),
            machine_id_prefix: default_machine_id_prefix(),
            node_name_prefix: default_node_name_prefix(),
            append_unique_suffix: true,
            use_mac_for_unique_id: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            enable_command_polling: false,
            command_poll_interval_ms: 0,
            session_endpoint_path: default_session_endpoint_path(),
            enable_self_approve: false,
            approve_endpoint_path: default_approve_endpoint_path(),
            approve_retry_ms: 0,
            send_reconnect_hint_in_hello: false,
            blink_on_heartbeat: false,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enable_node_registration: false,
            login_token: String::new(),
            pairing_code: String::new(),
            internal_key: String::new(),
            register_retry_ms: 0,
            prefer_register_by_slot: true,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable_tunnel: true,
            ws_tunnel_path: default_ws_tunnel_path(),
            max_tunnel_body_bytes: default_max_tunnel_body_bytes(),
            tunnel_reconnect_ms: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            hub: HubConfig::default(),
            identity: IdentityConfig::default(),
            session: SessionConfig::default(),
            registration: RegistrationConfig::default(),
            tunnel: TunnelConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `edgelink.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: AgentConfig = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("edgelink.toml").exists() {
            let content =
                std::fs::read_to_string("edgelink.toml").expect("Failed to read edgelink.toml");
            toml::from_str(&content).expect("Failed to parse edgelink.toml")
        } else {
            AgentConfig::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("EDGELINK_HUB_URL") {
            config.hub.base_url = url;
        }
        if let Ok(slot) = std::env::var("EDGELINK_SLOT_ID") {
            config.hub.slot_id = slot;
        }
        if let Ok(token) = std::env::var("EDGELINK_LOGIN_TOKEN") {
            config.registration.login_token = token;
        }

        config
    }

    /// Missing hub URL or slot id makes the agent unusable; the constructor
    /// turns this into a permanent ERROR state.
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.hub.base_url.is_empty() {
            return Some("hub.base_url");
        }
        if self.hub.slot_id.is_empty() {
            return Some("hub.slot_id");
        }
        None
    }
}
