//! The hub's three-phase device-auth protocol, plus heartbeat and command
//! polling.
//!
//! Every body carries a fresh nonce. Status words map onto state
//! transitions; HTTP 401/403 on an authed call always clears the session
//! and resumes HELLO, 410 discards whatever the hub declared gone.

use serde_json::json;

use crate::agent::{Agent, NodeState};
use crate::credentials::PairingState;
use crate::identity::{self, create_nonce};

/// Retry used when a PENDING reply carries no `retry_after_ms`.
const DEFAULT_PENDING_RETRY_MS: u64 = 3_000;

/// Session TTL assumed when a GRANT carries no `ttl_seconds`.
const DEFAULT_TTL_SECONDS: u64 = 3_600;

impl Agent {
    /// `POST /api/device/hello` — announce ourselves, receive PENDING /
    /// APPROVED (optionally with a pairing code) or DENIED.
    pub(crate) async fn send_hello(&mut self) -> bool {
        let mut body = json!({
            "slot_id": self.config.hub.slot_id,
            "nonce": create_nonce(),
            "firmware": self.identity.firmware_version,
            "capabilities_hash": self.identity.capabilities_hash,
            "device_info": {
                "platform": identity::PLATFORM,
                "firmware": self.identity.firmware_version,
            },
        });
        if self.config.session.send_reconnect_hint_in_hello && self.hello_attempted {
            body["reconnect"] = json!(true);
            body["boot_reason"] = json!("retry");
        }
        self.hello_attempted = true;

        let result = self.hub.post_json("/api/device/hello", &body, None, &[]).await;
        let now = self.clock.now_ms();
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("HELLO failed: {e}"));
                self.schedule_net_retry(now);
                return false;
            }
        };

        match response.status {
            401 | 403 => {
                self.set_last_error("HELLO rejected by hub auth");
                self.restart_hello(now, true, None).await;
                return false;
            }
            410 => {
                self.set_last_error("HELLO resource gone");
                self.pairing = None;
                self.restart_hello(now, true, None).await;
                return false;
            }
            s if !(200..300).contains(&s) => {
                self.set_last_error(&format!("HELLO HTTP {s}"));
                self.schedule_net_retry(now);
                return false;
            }
            _ => {}
        }

        let Some(status) = response.body["status"].as_str() else {
            self.set_last_error("HELLO response missing status");
            self.schedule_net_retry(now);
            return false;
        };

        match status {
            "PENDING" | "APPROVED" => {
                self.net_backoff.reset();
                self.clear_last_error();
                if let Some(code) = response.body["pairing_code"].as_str() {
                    self.pairing = Some(PairingState::new(
                        code,
                        response.body["pairing_expires_at"].as_str(),
                    ));
                    self.set_state(NodeState::PairSubmit);
                    self.next_net_action_ms = now;
                } else {
                    self.set_state(NodeState::PendingPoll);
                    let retry = response.body["retry_after_ms"]
                        .as_u64()
                        .unwrap_or(DEFAULT_PENDING_RETRY_MS);
                    self.next_net_action_ms = now + retry;
                }
                true
            }
            "DENIED" => {
                // A denied HELLO keeps retrying; only a denied session poll
                // is terminal.
                self.set_last_error("HELLO denied");
                self.creds.clear_session();
                self.schedule_net_retry(now);
                false
            }
            other => {
                self.set_last_error(&format!("HELLO unknown status {other}"));
                self.schedule_net_retry(now);
                false
            }
        }
    }

    /// `POST /api/device/session` — poll until GRANTED, PENDING again, or
    /// DENIED (terminal).
    pub(crate) async fn poll_session(&mut self) -> bool {
        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "nonce": create_nonce(),
        });
        let path = self.config.session.session_endpoint_path.clone();
        let result = self.hub.post_json(&path, &body, None, &[]).await;
        let now = self.clock.now_ms();
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("SESSION poll failed: {e}"));
                self.schedule_net_retry(now);
                return false;
            }
        };

        match response.status {
            401 | 403 | 410 => {
                self.set_last_error("SESSION rejected by hub auth");
                self.restart_hello(now, true, None).await;
                return false;
            }
            s if !(200..300).contains(&s) => {
                self.set_last_error(&format!("SESSION HTTP {s}"));
                self.schedule_net_retry(now);
                return false;
            }
            _ => {}
        }

        match response.body["status"].as_str() {
            Some("PENDING") => {
                let retry = response.body["retry_after_ms"]
                    .as_u64()
                    .unwrap_or(DEFAULT_PENDING_RETRY_MS);
                self.next_net_action_ms = now + retry;
                true
            }
            Some("GRANTED") => {
                let Some(token) = response.body["session_token"].as_str() else {
                    self.set_last_error("GRANT missing session_token");
                    self.restart_hello(now, true, None).await;
                    return false;
                };
                let ttl = response.body["ttl_seconds"]
                    .as_u64()
                    .unwrap_or(DEFAULT_TTL_SECONDS);
                self.creds.set_session(token, now + ttl * 1_000);
                if let Some(url) = response.body["tunnel_url"].as_str() {
                    self.creds.set_tunnel_url(url);
                }
                self.set_state(NodeState::Granted);
                self.persist(now).await;
                self.activate_session(now);
                true
            }
            Some("DENIED") => {
                self.enter_error(now, "SESSION denied by hub").await;
                false
            }
            _ => {
                self.set_last_error("SESSION response missing status");
                self.schedule_net_retry(now);
                false
            }
        }
    }

    /// PAIR_SUBMIT action: submit the stored pairing code, via the pair or
    /// the self-approve endpoint depending on configuration.
    pub(crate) async fn submit_pairing(&mut self) -> bool {
        let Some(pairing) = self.pairing.clone() else {
            // Nothing to submit; fall back to the poll path.
            let now = self.clock.now_ms();
            self.set_state(NodeState::PendingPoll);
            self.next_net_action_ms = now;
            return false;
        };

        let (path, body): (String, serde_json::Value) = if self.config.session.enable_self_approve {
            (
                self.config.session.approve_endpoint_path.clone(),
                json!({
                    "slot_id": self.config.hub.slot_id,
                    "pairing_code": pairing.code,
                    "mac": self.identity.machine_id,
                    "machine_id": self.identity.machine_id,
                    "firmware": self.identity.firmware_version,
                }),
            )
        } else {
            (
                "/api/device/pair".to_string(),
                json!({
                    "slot_id": self.config.hub.slot_id,
                    "pairing_code": pairing.code,
                    "firmware": self.identity.firmware_version,
                    "device_info": {
                        "platform": identity::PLATFORM,
                        "firmware": self.identity.firmware_version,
                    },
                }),
            )
        };

        let result = self.hub.post_json(&path, &body, None, &[]).await;
        let now = self.clock.now_ms();
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("PAIR failed: {e}"));
                self.record_pairing_failure(now);
                return false;
            }
        };

        if response.status == 410 {
            // The code is gone; HELLO will mint a fresh one.
            self.set_last_error("pairing code expired");
            self.pairing = None;
            self.restart_hello(now, false, None).await;
            return false;
        }
        if !response.is_success() {
            self.set_last_error(&format!("PAIR HTTP {}", response.status));
            self.record_pairing_failure(now);
            return false;
        }

        let Some(token) = response.body["session_token"].as_str() else {
            self.set_last_error("PAIR response missing session_token");
            self.record_pairing_failure(now);
            return false;
        };
        self.creds.set_session(token, 0);
        if let Some(node_id) = response.body["node_id"].as_str() {
            self.creds.set_node_id(node_id);
        }
        if let Some(node_token) = response.body["node_token"].as_str() {
            self.creds.set_node_auth_token(node_token);
        }
        if let Some(register_token) = response.body["register_token"].as_str() {
            self.creds.set_node_auth_token(register_token);
        }
        if let Some(url) = response.body["tunnel_url"].as_str() {
            self.creds.set_tunnel_url(url);
        }
        self.pairing = None;
        self.persist(now).await;
        self.activate_session(now);
        true
    }

    fn record_pairing_failure(&mut self, now: u64) {
        let exhausted = self
            .pairing
            .as_mut()
            .map(PairingState::record_failure)
            .unwrap_or(true);
        if exhausted {
            self.pairing = None;
            self.set_state(NodeState::Hello);
        }
        let retry = self.config.session.approve_retry_ms;
        if self.config.session.enable_self_approve && retry > 0 {
            self.next_net_action_ms = now + retry;
        } else {
            self.schedule_net_retry(now);
        }
    }

    /// `POST /api/device/heartbeat` — bearer-authorised liveness report.
    /// A `ttl_seconds` reply extends the session deadline.
    pub(crate) async fn send_heartbeat(&mut self) -> bool {
        let now = self.clock.now_ms();
        if !self.creds.session_valid(now) {
            return false;
        }
        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "nonce": create_nonce(),
            "firmware": self.identity.firmware_version,
            "uptime_ms": now,
            "rssi": self.link.rssi_dbm(),
            "free_heap": identity::free_memory_bytes(),
            "capabilities_hash": self.identity.capabilities_hash,
            "led_state": self.led_state,
        });
        let token = self.creds.session_token().to_string();
        let result = self
            .hub
            .post_json("/api/device/heartbeat", &body, Some(&token), &[])
            .await;
        let now = self.clock.now_ms();
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("heartbeat failed: {e}"));
                self.next_heartbeat_ms = now + self.net_backoff.next_delay();
                return false;
            }
        };

        match response.status {
            401 | 403 => {
                self.set_last_error("heartbeat rejected, session invalid");
                self.restart_hello(now, true, None).await;
                return false;
            }
            s if !(200..300).contains(&s) => {
                self.set_last_error(&format!("heartbeat HTTP {s}"));
                self.next_heartbeat_ms = now + self.net_backoff.next_delay();
                return false;
            }
            _ => {}
        }

        if let Some(ttl) = response.body["ttl_seconds"].as_u64() {
            self.creds.extend_session(now + ttl * 1_000);
        }
        if self.config.session.blink_on_heartbeat {
            self.led_state = !self.led_state;
        }
        self.net_backoff.reset();
        self.clear_last_error();
        self.next_heartbeat_ms = now + self.config.session.heartbeat_interval_ms;
        true
    }

    /// `POST /api/device/commands/pull` then one ack per command.
    pub(crate) async fn pull_commands(&mut self) -> bool {
        let now = self.clock.now_ms();
        self.next_command_action_ms = now + self.command_interval();
        if !self.creds.session_valid(now) {
            return true;
        }

        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "nonce": create_nonce(),
        });
        let token = self.creds.session_token().to_string();
        let result = self
            .hub
            .post_json("/api/device/commands/pull", &body, Some(&token), &[])
            .await;
        let now = self.clock.now_ms();
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("command pull failed: {e}"));
                self.schedule_net_retry(now);
                return false;
            }
        };

        if response.status == 401 || response.status == 403 {
            self.set_last_error("command pull rejected, session invalid");
            self.restart_hello(now, true, None).await;
            return false;
        }
        if !response.is_success() {
            self.set_last_error(&format!("command pull HTTP {}", response.status));
            self.schedule_net_retry(now);
            return false;
        }

        let commands: Vec<(String, String)> = response.body["commands"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|cmd| {
                        let id = cmd["id"].as_str()?;
                        let action = cmd["action"].as_str()?;
                        Some((id.to_string(), action.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (id, action) in commands {
            if let Some(cb) = self.hooks.on_command.as_mut() {
                cb(&id, &action);
            }
            self.ack_command(&id, &token).await;
        }

        self.net_backoff.reset();
        self.clear_last_error();
        true
    }

    async fn ack_command(&mut self, command_id: &str, token: &str) {
        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "command_id": command_id,
            "nonce": create_nonce(),
            "status": "handled",
        });
        match self
            .hub
            .post_json("/api/device/commands/ack", &body, Some(token), &[])
            .await
        {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                self.set_last_error(&format!("command ack HTTP {}", response.status));
            }
            Err(e) => {
                self.set_last_error(&format!("command ack failed: {e}"));
            }
        }
    }
}
