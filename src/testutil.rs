//! Scripted transports, clock, and link for state-machine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{Agent, Hooks, LinkMonitor, NodeState};
use crate::backoff::Clock;
use crate::config::AgentConfig;
use crate::hub::{HubError, HubResponse, HubTransport};
use crate::tunnel::{SocketEvent, TunnelError, TunnelSocket};

pub(crate) struct RecordedRequest {
    pub path: String,
    pub body: Value,
    pub bearer: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Scripted hub: responses are served FIFO, every request is recorded.
#[derive(Default)]
pub(crate) struct HubScript {
    pub responses: VecDeque<Result<HubResponse, HubError>>,
    pub requests: Vec<RecordedRequest>,
}

impl HubScript {
    pub fn push_ok(&mut self, status: u16, body: Value) {
        self.responses.push_back(Ok(HubResponse { status, body }));
    }
}

pub(crate) struct ScriptedHub(pub Arc<Mutex<HubScript>>);

#[async_trait]
impl HubTransport for ScriptedHub {
    async fn post_json(
        &mut self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<HubResponse, HubError> {
        let mut script = self.0.lock().unwrap();
        script.requests.push(RecordedRequest {
            path: path.to_string(),
            body: body.clone(),
            bearer: bearer.map(str::to_string),
            headers: extra_headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
        script
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(HubError::Transport("no scripted response".to_string())))
    }
}

/// Scripted tunnel socket: connects succeed unless scripted otherwise,
/// events are fed by the test, sends are recorded.
#[derive(Default)]
pub(crate) struct SocketScript {
    pub connect_results: VecDeque<Result<(), TunnelError>>,
    pub events: VecDeque<SocketEvent>,
    pub sent: Vec<String>,
    pub connects: Vec<(String, String)>,
    pub close_count: usize,
}

pub(crate) struct ScriptedSocket(pub Arc<Mutex<SocketScript>>);

#[async_trait]
impl TunnelSocket for ScriptedSocket {
    async fn connect(&mut self, url: &str, bearer: &str) -> Result<(), TunnelError> {
        let mut script = self.0.lock().unwrap();
        script.connects.push((url.to_string(), bearer.to_string()));
        script.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError> {
        self.0.lock().unwrap().sent.push(text.to_string());
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        self.0.lock().unwrap().events.pop_front()
    }

    async fn close(&mut self) {
        self.0.lock().unwrap().close_count += 1;
    }
}

pub(crate) struct ManualClock(pub Arc<AtomicU64>);

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub(crate) struct TestLink(pub Arc<AtomicBool>);

impl LinkMonitor for TestLink {
    fn is_up(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn rssi_dbm(&self) -> i32 {
        -61
    }
}

/// Everything a test needs to observe and steer an agent.
pub(crate) struct Rig {
    pub hub: Arc<Mutex<HubScript>>,
    pub socket: Arc<Mutex<SocketScript>>,
    pub clock: Arc<AtomicU64>,
    pub link: Arc<AtomicBool>,
    pub transitions: Arc<Mutex<Vec<(NodeState, NodeState)>>>,
    pub errors: Arc<Mutex<Vec<String>>>,
    pub session_invalid: Arc<AtomicU64>,
    pub tunnel_events: Arc<Mutex<Vec<bool>>>,
    pub registered: Arc<Mutex<Vec<String>>>,
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl Rig {
    pub fn advance(&self, ms: u64) {
        self.clock.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn push_event(&self, event: SocketEvent) {
        self.socket.lock().unwrap().events.push_back(event);
    }
}

/// Minimal valid config for tests: plain-HTTP hub, persistence and tunnel
/// disabled (tests opt in per case).
pub(crate) fn test_config() -> AgentConfig {
    let mut config: AgentConfig = toml::from_str(
        r#"
        [hub]
        base_url = "http://hub.test"
        slot_id = "slot-1"

        [identity]
        firmware_version = "1.0.0-test"
        capabilities = ["gpio"]
        machine_id = "node-test"
        node_name = "Node-Test"
        "#,
    )
    .unwrap();
    config.storage.data_dir = String::new();
    config.tunnel.enable_tunnel = false;
    config
}

/// Build an agent wired to scripted parts, with every hook recording.
pub(crate) fn rig_agent(config: AgentConfig) -> (Agent, Rig) {
    rig_agent_with_store(config, None)
}

/// Same as [`rig_agent`] but with a real state store attached.
pub(crate) fn rig_agent_with_store(
    config: AgentConfig,
    store: Option<crate::store::StateStore>,
) -> (Agent, Rig) {
    let rig = Rig {
        hub: Arc::new(Mutex::new(HubScript::default())),
        socket: Arc::new(Mutex::new(SocketScript::default())),
        clock: Arc::new(AtomicU64::new(0)),
        link: Arc::new(AtomicBool::new(true)),
        transitions: Arc::new(Mutex::new(Vec::new())),
        errors: Arc::new(Mutex::new(Vec::new())),
        session_invalid: Arc::new(AtomicU64::new(0)),
        tunnel_events: Arc::new(Mutex::new(Vec::new())),
        registered: Arc::new(Mutex::new(Vec::new())),
        commands: Arc::new(Mutex::new(Vec::new())),
    };

    let mut agent = Agent::with_parts(
        config,
        Box::new(ScriptedHub(rig.hub.clone())),
        Box::new(ScriptedSocket(rig.socket.clone())),
        Box::new(TestLink(rig.link.clone())),
        Arc::new(ManualClock(rig.clock.clone())),
        store,
    );

    let transitions = rig.transitions.clone();
    let errors = rig.errors.clone();
    let session_invalid = rig.session_invalid.clone();
    let tunnel_events = rig.tunnel_events.clone();
    let registered = rig.registered.clone();
    let commands = rig.commands.clone();
    agent.set_hooks(Hooks {
        on_state_change: Some(Box::new(move |old, new| {
            transitions.lock().unwrap().push((old, new));
        })),
        on_error: Some(Box::new(move |msg| {
            errors.lock().unwrap().push(msg.to_string());
        })),
        on_session_invalid: Some(Box::new(move || {
            session_invalid.fetch_add(1, Ordering::Relaxed);
        })),
        on_tunnel: Some(Box::new(move |up| {
            tunnel_events.lock().unwrap().push(up);
        })),
        on_registered: Some(Box::new(move |node_id| {
            registered.lock().unwrap().push(node_id.to_string());
        })),
        on_command: Some(Box::new(move |id, action| {
            commands
                .lock()
                .unwrap()
                .push((id.to_string(), action.to_string()));
        })),
    });

    (agent, rig)
}
