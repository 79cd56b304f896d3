//! Hub HTTP client.
//!
//! [`HubClient`] wraps two `reqwest::Client`s — one TLS, one plaintext —
//! built once and reused for every call. Responses are read through a
//! counting loop capped at [`MAX_RESPONSE`] bytes and parsed as JSON; the
//! session layer interprets status codes.
//!
//! ## TLS policy
//!
//! `allow_insecure_tls` skips verification; otherwise a configured
//! `root_ca_pem` is pinned as the sole trust anchor; with neither, the
//! client degrades to insecure and logs the degradation once.
//!
//! ## HTTPS fallback
//!
//! After [`MAX_HTTPS_FAIL`] consecutive TLS connect failures, subsequent
//! calls target `http://<host>:80`. Any successful call resets the counter
//! and restores HTTPS.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Cap on a hub response body in bytes.
pub const MAX_RESPONSE: usize = 2048;

/// Consecutive TLS connect failures before falling back to plain HTTP.
pub const MAX_HTTPS_FAIL: u32 = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(3);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Certificate validity checks need a plausible epoch; refuse to start TLS
/// before this (2024-01-01) and wait up to the ceiling for NTP to land.
const PLAUSIBLE_EPOCH_SECS: u64 = 1_704_067_200;
const CLOCK_WAIT_CEILING: Duration = Duration::from_secs(10);

/// Errors from a single `post_json` call.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("response exceeds {MAX_RESPONSE} bytes")]
    ResponseTooLarge,
    #[error("invalid JSON in response: {0}")]
    Json(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Parsed hub reply: HTTP status plus JSON body (`Null` when empty).
#[derive(Debug, Clone)]
pub struct HubResponse {
    pub status: u16,
    pub body: Value,
}

impl HubResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Seam between the session layer and HTTP. Tests script this.
#[async_trait]
pub trait HubTransport: Send {
    /// POST a JSON body to `path` (relative to the hub base URL), with an
    /// optional bearer token and extra headers.
    async fn post_json(
        &mut self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<HubResponse, HubError>;
}

/// Production transport over reqwest.
pub struct HubClient {
    tls: reqwest::Client,
    plain: reqwest::Client,
    base_url: Url,
    base_is_https: bool,
    https_fails: u32,
    clock_checked: bool,
}

impl HubClient {
    /// Build the two shared clients. Never fails: a broken CA PEM degrades
    /// to insecure with a logged warning, mirroring the missing-CA path.
    pub fn new(base_url: &str, allow_insecure_tls: bool, root_ca_pem: Option<&str>) -> Result<Self, HubError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| HubError::Transport(format!("invalid hub base URL: {e}")))?;
        let base_is_https = base_url.scheme() == "https";

        let tls = Self::build_tls_client(allow_insecure_tls, root_ca_pem);
        let plain = base_builder()
            .build()
            .map_err(|e| HubError::Transport(e.to_string()))?;

        Ok(Self {
            tls,
            plain,
            base_url,
            base_is_https,
            https_fails: 0,
            clock_checked: false,
        })
    }

    fn build_tls_client(allow_insecure_tls: bool, root_ca_pem: Option<&str>) -> reqwest::Client {
        let builder = base_builder();
        let builder = if allow_insecure_tls {
            builder.danger_accept_invalid_certs(true)
        } else if let Some(pem) = root_ca_pem {
            match reqwest::Certificate::from_pem(pem.as_bytes()) {
                Ok(cert) => builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(cert),
                Err(e) => {
                    warn!("Invalid root_ca_pem ({e}), TLS verification degraded to insecure");
                    builder.danger_accept_invalid_certs(true)
                }
            }
        } else {
            warn!("No root CA configured, TLS verification degraded to insecure");
            builder.danger_accept_invalid_certs(true)
        };
        builder.build().expect("reqwest client")
    }

    /// Whether the next call should use TLS.
    fn effective_https(&self) -> bool {
        self.base_is_https && self.https_fails < MAX_HTTPS_FAIL
    }

    /// Target URL for `path`, rewritten to `http://<host>:80` while in
    /// fallback.
    fn build_url(&self, path: &str, https: bool) -> Result<Url, HubError> {
        let mut url = self.base_url.clone();
        if self.base_is_https && !https {
            url.set_scheme("http")
                .map_err(|()| HubError::Transport("scheme rewrite failed".to_string()))?;
            url.set_port(Some(80))
                .map_err(|()| HubError::Transport("port rewrite failed".to_string()))?;
        }
        let joined = format!("{}{}", url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| HubError::Transport(format!("invalid path: {e}")))
    }

    /// Wait (bounded) for the wall clock to look sane before the first
    /// HTTPS call; certificate validation against epoch 1970 always fails.
    async fn await_plausible_clock(&self) {
        let deadline = std::time::Instant::now() + CLOCK_WAIT_CEILING;
        loop {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if now >= PLAUSIBLE_EPOCH_SECS {
                return;
            }
            if std::time::Instant::now() >= deadline {
                warn!("Wall clock still implausible after {CLOCK_WAIT_CEILING:?}, TLS may fail");
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(FIRST_BYTE_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
}

/// Append a chunk to the accumulating body, refusing to grow past the cap.
fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8]) -> Result<(), HubError> {
    if buf.len() + chunk.len() > MAX_RESPONSE {
        return Err(HubError::ResponseTooLarge);
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

#[async_trait]
impl HubTransport for HubClient {
    async fn post_json(
        &mut self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<HubResponse, HubError> {
        let https = self.effective_https();
        if https && !self.clock_checked {
            self.await_plausible_clock().await;
            self.clock_checked = true;
        }

        let url = self.build_url(path, https)?;
        let client = if https { &self.tls } else { &self.plain };

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }

        let mut response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                if https && e.is_connect() {
                    self.https_fails += 1;
                    debug!(
                        "TLS connect failure {}/{MAX_HTTPS_FAIL}",
                        self.https_fails
                    );
                }
                return Err(if e.is_timeout() {
                    HubError::Timeout
                } else if e.is_connect() {
                    HubError::Connect(e.to_string())
                } else {
                    HubError::Transport(e.to_string())
                });
            }
        };

        // Headers arrived: the connection (and TLS handshake) worked.
        self.https_fails = 0;

        let status = response.status().as_u16();
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => append_bounded(&mut bytes, &chunk)?,
                Ok(None) => break,
                Err(e) => {
                    return Err(if e.is_timeout() {
                        HubError::Timeout
                    } else {
                        HubError::Transport(e.to_string())
                    })
                }
            }
        }

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| HubError::Json(e.to_string()))?
        };

        Ok(HubResponse { status, body })
    }
}
