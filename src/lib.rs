#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgelink
//!
//! Reverse-tunnel edge agent for hub-managed device fleets.
//!
//! The agent registers a device with a central hub over HTTP(S), maintains a
//! persistent upstream WebSocket tunnel, and answers HTTP requests the hub
//! pushes through that tunnel. The core is a tick-driven state machine: the
//! embedder calls [`Agent::tick`] on an interval and everything — session
//! lifecycle, reconnect ladders, stream reassembly — advances from there.
//!
//! ## Protocol surface
//!
//! | Phase      | Endpoint                     | Outcome                        |
//! |------------|------------------------------|--------------------------------|
//! | HELLO      | `POST /api/device/hello`     | PENDING/APPROVED or DENIED     |
//! | PAIR       | `POST /api/device/pair`      | session token + node id        |
//! | SESSION    | `POST /api/device/session`   | GRANTED with TTL, or PENDING   |
//! | HEARTBEAT  | `POST /api/device/heartbeat` | TTL extension                  |
//! | COMMANDS   | `POST /api/device/commands/*`| pull + per-command ack         |
//! | REGISTER   | `POST /api/nodes/register*`  | node auth token + tunnel URL   |
//! | TUNNEL     | `wss://<hub>/ws/tunnel`      | HTTP-over-WS request streams   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap, tracing init, tick loop, shutdown
//! config.rs        — TOML + env-var configuration
//! backoff.rs       — monotonic clock, geometric and discrete retry ladders
//! credentials.rs   — bounded credential store, pairing state
//! identity.rs      — machine id, capability hash, nonces, host telemetry
//! hub.rs           — shared reqwest clients, bounded reads, HTTPS fallback
//! session.rs       — hello/pair/approve/session/heartbeat/commands
//! registration.rs  — register-by-slot, register-by-pairing
//! store.rs         — best-effort JSON credential persistence
//! agent.rs         — the state machine and tick driver
//! tunnel/
//!   transport.rs   — WebSocket socket with event queue, no auto-reconnect
//!   mux.rs         — stream reassembly, size caps, response framing, router
//! ```

pub mod agent;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod hub;
pub mod identity;
pub mod registration;
pub mod session;
pub mod store;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use agent::{Agent, AlwaysUp, Hooks, LinkMonitor, NodeState};
pub use config::AgentConfig;
pub use credentials::Credentials;
pub use hub::{HubClient, HubError, HubResponse, HubTransport};
pub use tunnel::{RequestHandler, TunnelRequest, TunnelResponse};
