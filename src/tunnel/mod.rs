//! Upstream WebSocket tunnel.
//!
//! The hub pushes inbound HTTP requests through a persistent outbound
//! WebSocket. This module owns the two halves:
//!
//! - `transport` — the socket itself: connect with a bearer header, an event
//!   queue drained by the agent tick, sends through a split sink. The
//!   transport never reconnects on its own; the agent schedules reconnects
//!   on its ladder.
//! - `mux` — HTTP-over-WS stream multiplexing: chunked request reassembly
//!   with a hard size cap, dispatch to a handler or the built-in router, and
//!   response framing.

pub mod mux;
pub mod transport;

pub use mux::{RequestHandler, StreamMux, TunnelRequest, TunnelResponse};
pub use transport::{SocketEvent, TunnelError, TunnelSocket, WsTransport};
