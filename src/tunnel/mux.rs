//! HTTP-over-WebSocket stream multiplexing.
//!
//! Two wire dialects coexist on the tunnel:
//!
//! - **control/data** — `control{open_stream}` starts a stream, `data`
//!   frames carry base64 chunks of a raw HTTP/1.1 request (client→node
//!   direction `c2n`), and the response goes back as one `data` frame in
//!   direction `n2c`. At most one stream is live at a time and its buffer
//!   is capped; overflow answers `413 Payload Too Large` and closes the
//!   stream.
//! - **HTTP_REQ / HTTP_RES** — a self-contained request envelope answered
//!   synchronously with the same `stream_id`.
//!
//! Requests are offered to the registered handler first; the built-in
//! router answers `/ping` and `/status` (with `/api/` aliases) and 404s
//! everything else.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Longest accepted `stream_id` in bytes.
pub const MAX_STREAM_ID: usize = 63;

/// One inbound request as seen by handlers.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A handler's answer; framed by the mux for whichever dialect carried the
/// request.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl TunnelResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }
}

/// External request handler. Returning `None` falls through to the
/// built-in router. Handlers borrow the request for the duration of the
/// call and must not retain it.
pub trait RequestHandler: Send {
    fn handle(&mut self, request: &TunnelRequest) -> Option<TunnelResponse>;
}

/// The single in-flight stream of the legacy dialect.
#[derive(Debug)]
struct ActiveStream {
    stream_id: String,
    buf: Vec<u8>,
}

/// Reassembles inbound requests and frames outbound responses.
pub struct StreamMux {
    active: Option<ActiveStream>,
    max_body: usize,
    handler: Option<Box<dyn RequestHandler>>,
}

impl StreamMux {
    pub fn new(max_body: usize) -> Self {
        Self {
            active: None,
            max_body,
            handler: None,
        }
    }

    pub fn set_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    /// Stream id currently being reassembled, if any.
    pub fn active_stream_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.stream_id.as_str())
    }

    /// Drop any in-flight stream (tunnel teardown).
    pub fn reset(&mut self) {
        self.active = None;
    }

    /// Process one tunnel frame; returns the text frames to send back.
    pub fn handle_frame(&mut self, frame: &Value, uptime_ms: u64, node_id: &str) -> Vec<String> {
        match frame["type"].as_str() {
            Some("control") => {
                self.handle_control(frame);
                Vec::new()
            }
            Some("data") => self.handle_data(frame, uptime_ms, node_id),
            Some("HTTP_REQ") => self.handle_envelope(frame, uptime_ms, node_id),
            _ => Vec::new(),
        }
    }

    fn handle_control(&mut self, frame: &Value) {
        let Some(cmd) = frame["cmd"].as_str() else {
            return;
        };
        match cmd {
            "open_stream" => {
                let Some(stream_id) = frame["stream_id"].as_str() else {
                    return;
                };
                if stream_id.is_empty() || stream_id.len() > MAX_STREAM_ID {
                    warn!("Rejecting open_stream with bad stream_id length");
                    return;
                }
                debug!("Stream open id={stream_id}");
                // Only one stream at a time; a new open replaces the old.
                self.active = Some(ActiveStream {
                    stream_id: stream_id.to_string(),
                    buf: Vec::new(),
                });
            }
            "close_stream" => {
                // The close may omit the stream id; a mismatched id is ignored.
                let matches = match (frame["stream_id"].as_str(), &self.active) {
                    (Some(id), Some(active)) => id == active.stream_id,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if matches {
                    debug!("Stream closed by hub");
                    self.active = None;
                }
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, frame: &Value, uptime_ms: u64, node_id: &str) -> Vec<String> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if frame["direction"].as_str() != Some("c2n") {
            return Vec::new();
        }
        let Some(payload64) = frame["payload_base64"].as_str() else {
            return Vec::new();
        };
        let decoded = match BASE64.decode(payload64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping undecodable data chunk: {e}");
                return Vec::new();
            }
        };

        if active.buf.len() + decoded.len() > self.max_body {
            let stream_id = active.stream_id.clone();
            self.active = None;
            let response =
                TunnelResponse::json(413, r#"{"ok":false,"error":"payload_too_large"}"#);
            return vec![data_frame(&stream_id, &build_raw_response(&response))];
        }
        active.buf.extend_from_slice(&decoded);

        let Some(request) = try_parse_request(&active.buf) else {
            return Vec::new();
        };
        let stream_id = active.stream_id.clone();
        self.active = None;
        let response = self.dispatch(&request, uptime_ms, node_id);
        vec![data_frame(&stream_id, &build_raw_response(&response))]
    }

    fn handle_envelope(&mut self, frame: &Value, uptime_ms: u64, node_id: &str) -> Vec<String> {
        let Some(stream_id) = frame["stream_id"].as_str() else {
            return Vec::new();
        };
        if stream_id.is_empty() || stream_id.len() > MAX_STREAM_ID {
            return Vec::new();
        }
        let method = frame["method"].as_str().unwrap_or("GET").to_string();
        let Some(path) = frame["path"].as_str() else {
            return Vec::new();
        };
        let headers = frame["headers"]
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let body = frame["body"].as_str().unwrap_or("").as_bytes().to_vec();

        if body.len() > self.max_body {
            let response =
                TunnelResponse::json(413, r#"{"ok":false,"error":"payload_too_large"}"#);
            return vec![envelope_response(stream_id, &response)];
        }

        let request = TunnelRequest {
            method,
            path: path.to_string(),
            headers,
            body,
        };
        let response = self.dispatch(&request, uptime_ms, node_id);
        vec![envelope_response(stream_id, &response)]
    }

    fn dispatch(&mut self, request: &TunnelRequest, uptime_ms: u64, node_id: &str) -> TunnelResponse {
        if let Some(handler) = self.handler.as_mut() {
            if let Some(response) = handler.handle(request) {
                return response;
            }
        }
        builtin_route(request, uptime_ms, node_id)
    }
}

/// Built-in router for the handful of paths every node answers.
fn builtin_route(request: &TunnelRequest, uptime_ms: u64, node_id: &str) -> TunnelResponse {
    let path = request.path.to_lowercase();
    if request.method == "GET" && (path == "/ping" || path == "/api/ping") {
        return TunnelResponse::json(200, r#"{"ok":true}"#);
    }
    if request.method == "GET" && (path == "/status" || path == "/api/status") {
        let body = json!({
            "ok": true,
            "uptime_ms": uptime_ms,
            "node_id": node_id,
        });
        return TunnelResponse::json(200, body.to_string());
    }
    TunnelResponse::json(404, r#"{"ok":false,"error":"not_found"}"#)
}

/// Parse a raw HTTP/1.1 request out of the reassembly buffer. `None` until
/// the header block and the declared body are both complete.
fn try_parse_request(buf: &[u8]) -> Option<TunnelRequest> {
    let header_end = find_subsequence(buf, b"\r\n\r\n")?;
    let header_block = std::str::from_utf8(&buf[..header_end]).ok()?;

    let mut lines = header_block.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        // Case-sensitive on purpose: the hub always sends the canonical form.
        if name == "Content-Length" {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let body_start = header_end + 4;
    if buf.len() - body_start < content_length {
        return None;
    }
    let body = buf[body_start..body_start + content_length].to_vec();

    Some(TunnelRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serialize a response as raw HTTP/1.1 for the legacy dialect.
fn build_raw_response(response: &TunnelResponse) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
        response.body
    )
    .into_bytes()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// A `data` frame carrying `payload` back to the hub.
fn data_frame(stream_id: &str, payload: &[u8]) -> String {
    json!({
        "type": "data",
        "stream_id": stream_id,
        "direction": "n2c",
        "payload_base64": BASE64.encode(payload),
    })
    .to_string()
}

/// An `HTTP_RES` envelope answering `stream_id`.
fn envelope_response(stream_id: &str, response: &TunnelResponse) -> String {
    json!({
        "type": "HTTP_RES",
        "stream_id": stream_id,
        "status": response.status,
        "headers": { "Content-Type": response.content_type },
        "body": response.body,
    })
    .to_string()
}
