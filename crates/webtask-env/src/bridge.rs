//! Client for the browser bridge, the sidecar container that holds the
//! actual browser. Every call is a POST of `{"command", "api-key"}` to
//! an endpoint on the bridge's loopback port, carried over `docker exec
//! curl` so the harness never needs a route into the session network.
//!
//! Calls against one bridge container must stay serialized; the client
//! takes `&self` but the owning environment only ever issues one call
//! at a time.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use webtask_core::Service;
use webtask_session::ContainerSession;

/// Retry budget for calls with no side effects (content fetches,
/// snapshots). Mutating calls are never retried.
const IDEMPOTENT_RETRIES: usize = 10;

pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub url: Option<String>,
}

impl BridgeResponse {
    pub fn ok(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn content_str(&self) -> Option<&str> {
        self.content.as_str()
    }

    /// Reject-with-message turned into an error for callers that treat
    /// any failure the same way.
    pub fn into_ok(self) -> Result<BridgeResponse> {
        if self.ok() {
            Ok(self)
        } else {
            Err(anyhow!(
                "bridge rejected command: {}",
                self.message.as_deref().unwrap_or("no message")
            ))
        }
    }
}

pub struct BridgeClient {
    session: Arc<ContainerSession>,
    api_key: String,
}

impl BridgeClient {
    pub fn new(session: Arc<ContainerSession>) -> Self {
        let api_key = session.config().bridge_api_key.clone();
        BridgeClient { session, api_key }
    }

    /// Start a fresh browser context on the bridge. A storage-state
    /// file path seeds the context with saved cookies and local
    /// storage, the way a logged-in session would have left them.
    pub fn setup(&self, storage_state: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "api-key": self.api_key });
        if let Some(path) = storage_state {
            body["storage_state"] = Value::String(path.to_string());
        }
        self.post("setup", body)?.into_ok().map(|_| ())
    }

    /// Dispose the browser context. Best effort on teardown paths.
    pub fn shutdown(&self) -> Result<()> {
        self.post("shutdown", serde_json::json!({ "api-key": self.api_key }))?
            .into_ok()
            .map(|_| ())
    }

    fn command_body(&self, command: &str) -> Value {
        serde_json::json!({
            "command": command,
            "api-key": self.api_key,
        })
    }

    /// Execute a command with side effects. Never retried: a timeout
    /// after a click may mean the click landed.
    pub fn exec(&self, command: &str) -> Result<BridgeResponse> {
        self.post("exec_command", self.command_body(command))
    }

    /// Execute a read-only command, retrying transport failures.
    pub fn exec_idempotent(&self, command: &str) -> Result<BridgeResponse> {
        let mut last_err = None;
        for attempt in 0..IDEMPOTENT_RETRIES {
            match self.post("exec_command", self.command_body(command)) {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(command, attempt, error = %e, "bridge call failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("bridge call failed")))
    }

    fn post(&self, endpoint: &str, body: Value) -> Result<BridgeResponse> {
        let body = body.to_string();
        let port = Service::BrowserBridge
            .internal_port()
            .ok_or_else(|| anyhow!("bridge service has no port"))?;
        let url = format!("http://localhost:{port}/{endpoint}");
        debug!(endpoint, "bridge call");
        let out = self.session.exec(
            Service::BrowserBridge,
            &[
                "curl",
                "-sS",
                "-X",
                "POST",
                "-H",
                "Content-Type: application/json",
                "-d",
                &body,
                &url,
            ],
        )?;
        if !out.success() {
            return Err(anyhow!(
                "bridge transport failed (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            ));
        }
        serde_json::from_str(&out.stdout)
            .with_context(|| format!("decoding bridge response: {}", out.stdout.trim()))
    }
}

/// Render a string as a double-quoted command argument, escaping what
/// the bridge's parser would otherwise treat as syntax.
pub fn quote_arg(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('"');
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}
