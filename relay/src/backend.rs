//! HTTP client for the backend service.
//!
//! Every forwarded request is a single POST of the JSON-RPC object to the
//! backend URL the client chose at stream-open time, carrying the session's
//! credential. There are no retries here; a timeout surfaces as its own error
//! kind so callers further up can decide what to do with it.

use async_trait::async_trait;
use mcp_relay_types::jsonrpc::error_codes;
use mcp_relay_types::{JsonRpcRequest, JsonRpcResponse};
use reqwest::{header, Client, Url};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::auth::AuthContext;

/// Longest backend body excerpt kept in error data.
const MAX_ERROR_BODY: usize = 512;

/// Errors from a backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend did not reply within {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("Malformed backend reply: {0}")]
    Malformed(String),

    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),
}

impl BackendError {
    /// Stable label used in logs and in the `data.kind` of error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unreachable(_) => "unreachable",
            Self::Status { .. } => "http_status",
            Self::Malformed(_) => "malformed_reply",
            Self::Client(_) => "client",
        }
    }

    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::Timeout(_) => error_codes::BACKEND_TIMEOUT,
            Self::Unreachable(_) => error_codes::BACKEND_UNREACHABLE,
            Self::Status { .. } => error_codes::BACKEND_HTTP_STATUS,
            Self::Malformed(_) | Self::Client(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Turn the failure into a protocol-level error reply.
    pub fn into_response(self, id: Option<Value>) -> JsonRpcResponse {
        let mut data = json!({ "kind": self.kind() });
        match &self {
            Self::Status { status, body } => {
                data["status"] = json!(status);
                if !body.is_empty() {
                    data["body"] = json!(body);
                }
            }
            Self::Timeout(timeout) => {
                data["timeout_ms"] = json!(timeout.as_millis() as u64);
            }
            _ => {}
        }
        JsonRpcResponse::error_with_data(id, self.code(), self.to_string(), data)
    }
}

/// Something that can answer forwarded JSON-RPC requests.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Forward one request.
    ///
    /// Returns `Ok(None)` when the backend accepted the message without a
    /// reply body, which is expected for notifications.
    async fn call(
        &self,
        backend_url: &Url,
        auth: &AuthContext,
        request: &JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, BackendError>;
}

/// [`Backend`] implementation over plain HTTP request/response.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, error: reqwest::Error) -> BackendError {
        if error.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if error.is_decode() {
            BackendError::Malformed(error.to_string())
        } else if error.is_builder() {
            BackendError::Client(error)
        } else {
            BackendError::Unreachable(error.to_string())
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(
        &self,
        backend_url: &Url,
        auth: &AuthContext,
        request: &JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, BackendError> {
        debug!(backend = %backend_url, method = %request.method, "Forwarding request");

        let response = self
            .client
            .post(backend_url.clone())
            .header(header::AUTHORIZATION, auth.header_value())
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        match parse_reply(content_type.as_deref(), &body) {
            // A structured JSON-RPC reply wins even on an error status
            Ok(Some(reply)) => Ok(Some(reply)),
            _ if !status.is_success() => Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            }),
            other => other,
        }
    }
}

/// Parse a backend body into a JSON-RPC reply.
///
/// Bodies framed as `text/event-stream` are scanned for the first event whose
/// data is a JSON-RPC reply.
pub fn parse_reply(
    content_type: Option<&str>,
    body: &str,
) -> Result<Option<JsonRpcResponse>, BackendError> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    let is_event_stream = content_type
        .map(|ct| ct.trim_start().starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        for data in event_stream_payloads(body) {
            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                if is_reply(&value) {
                    return response_from_value(value).map(Some);
                }
            }
        }
        return Err(BackendError::Malformed(
            "event stream carried no JSON-RPC reply".to_string(),
        ));
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    response_from_value(value).map(Some)
}

fn is_reply(value: &Value) -> bool {
    value
        .as_object()
        .map(|o| o.contains_key("result") || o.contains_key("error"))
        .unwrap_or(false)
}

fn response_from_value(value: Value) -> Result<JsonRpcResponse, BackendError> {
    if !is_reply(&value) {
        return Err(BackendError::Malformed(
            "reply carries neither result nor error".to_string(),
        ));
    }

    let explicit_null_result = value.get("result").map(Value::is_null).unwrap_or(false);
    let mut response: JsonRpcResponse =
        serde_json::from_value(value).map_err(|e| BackendError::Malformed(e.to_string()))?;

    // `"result": null` is a valid result, keep it distinguishable from absence
    if explicit_null_result && response.error.is_none() {
        response.result = Some(Value::Null);
    }
    Ok(response)
}

/// Collect the `data:` payload of every event in an SSE body.
fn event_stream_payloads(body: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                payloads.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if !current.is_empty() {
        payloads.push(current.join("\n"));
    }
    payloads
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Errors from validating a client-supplied backend URL.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendUrlError {
    #[error("Missing backend URL")]
    Missing,

    #[error("Invalid backend URL: {0}")]
    Invalid(String),

    #[error("Unsupported backend URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Backend host not allowed: {0}")]
    HostNotAllowed(String),
}

/// Validate the backend URL a client asked to be relayed to.
///
/// An empty `allowed_hosts` list accepts any host.
pub fn validate_backend_url(
    raw: Option<&str>,
    allowed_hosts: &[String],
) -> Result<Url, BackendUrlError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(BackendUrlError::Missing)?;
    let url = Url::parse(raw).map_err(|e| BackendUrlError::Invalid(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(BackendUrlError::UnsupportedScheme(other.to_string())),
    }

    let host = url
        .host_str()
        .ok_or_else(|| BackendUrlError::Invalid("URL has no host".to_string()))?;

    if !allowed_hosts.is_empty()
        && !allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    {
        return Err(BackendUrlError::HostNotAllowed(host.to_string()));
    }

    Ok(url)
}
