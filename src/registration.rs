//! Node registration with the hub's fleet inventory.
//!
//! Two mutually-exclusive flows, tried in the order `prefer_register_by_slot`
//! dictates. Success writes node id, auth token, and tunnel URL atomically
//! and never runs again; failures back off on the register ladder and never
//! disturb existing credentials.

use serde_json::json;

use crate::agent::Agent;
use crate::identity;

impl Agent {
    /// Entry point from the active loop. No-op once registered.
    pub(crate) async fn register_node_if_needed(&mut self, now: u64) -> bool {
        if !self.config.registration.enable_node_registration || self.is_registered {
            return true;
        }
        if now < self.next_register_action_ms {
            return false;
        }

        let by_slot_ready = !self.config.registration.login_token.is_empty();
        let by_pairing_ready = !self.config.registration.pairing_code.is_empty();

        let mut attempted = false;
        let mut success = false;
        if self.config.registration.prefer_register_by_slot {
            if by_slot_ready {
                attempted = true;
                success = self.register_by_slot().await;
            }
            if !success && by_pairing_ready {
                attempted = true;
                success = self.register_by_pairing().await;
            }
        } else {
            if by_pairing_ready {
                attempted = true;
                success = self.register_by_pairing().await;
            }
            if !success && by_slot_ready {
                attempted = true;
                success = self.register_by_slot().await;
            }
        }

        let now = self.clock.now_ms();
        if !attempted {
            self.set_last_error("no registration method configured");
            self.schedule_register_retry(now);
            return false;
        }

        if success {
            self.is_registered = true;
            self.register_backoff.reset();
            self.persist(now).await;
            tracing::info!("Node registered, node_id={}", self.creds.node_id());
            let node_id = self.creds.node_id().to_string();
            if let Some(cb) = self.hooks.on_registered.as_mut() {
                cb(&node_id);
            }
            return true;
        }

        self.schedule_register_retry(now);
        false
    }

    /// `POST /api/nodes/register_by_slot` with the operator login token.
    pub(crate) async fn register_by_slot(&mut self) -> bool {
        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "login_token": self.config.registration.login_token,
            "machine_id": self.identity.machine_id,
            "node_name": self.identity.node_name,
            "platform": identity::PLATFORM,
            "agent_version": self.identity.firmware_version,
        });
        let result = self
            .hub
            .post_json("/api/nodes/register_by_slot", &body, None, &[])
            .await;
        self.apply_registration_response("register_by_slot", result)
    }

    /// `POST /api/nodes/register` with a pairing code, optionally keyed with
    /// `X-Internal-Key`.
    pub(crate) async fn register_by_pairing(&mut self) -> bool {
        let body = json!({
            "slot_id": self.config.hub.slot_id,
            "pairing_code": self.config.registration.pairing_code,
            "node_info": {
                "os": identity::PLATFORM,
                "arch": std::env::consts::ARCH,
                "version": self.identity.firmware_version,
            },
        });
        let internal_key = self.config.registration.internal_key.clone();
        let headers: Vec<(&str, &str)> = if internal_key.is_empty() {
            Vec::new()
        } else {
            vec![("X-Internal-Key", internal_key.as_str())]
        };
        let result = self
            .hub
            .post_json("/api/nodes/register", &body, None, &headers)
            .await;
        self.apply_registration_response("register", result)
    }

    /// Shared success handling: both flows answer 200/201 with
    /// `{node_id, node_auth_token, tunnel_url?}`.
    fn apply_registration_response(
        &mut self,
        what: &str,
        result: Result<crate::hub::HubResponse, crate::hub::HubError>,
    ) -> bool {
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.set_last_error(&format!("{what} failed: {e}"));
                return false;
            }
        };
        if response.status != 200 && response.status != 201 {
            self.set_last_error(&format!("{what} HTTP {}", response.status));
            return false;
        }
        let (Some(node_id), Some(auth)) = (
            response.body["node_id"].as_str(),
            response.body["node_auth_token"].as_str(),
        ) else {
            self.set_last_error(&format!("{what} response missing tokens"));
            return false;
        };
        // A response without a tunnel URL keeps whatever we already have.
        let existing = self.creds.tunnel_url().to_string();
        let tunnel = response.body["tunnel_url"].as_str().unwrap_or(&existing);
        if !self.creds.set_registration(node_id, auth, tunnel) {
            self.set_last_error(&format!("{what} response fields oversized"));
            return false;
        }
        true
    }

    fn schedule_register_retry(&mut self, now: u64) {
        self.next_register_action_ms = now + self.register_backoff.next_delay();
    }
}
