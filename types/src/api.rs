//! HTTP API request/response payloads.

use serde::{Deserialize, Serialize};

/// Name of the first event on every stream. Its data is the submission address.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// Name of the events carrying JSON-RPC replies.
pub const MESSAGE_EVENT: &str = "message";

/// Query parameter carrying the session id on the submission address.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Acknowledgment returned by the submission endpoint.
///
/// This only says the request was accepted for asynchronous processing.
/// The actual reply is delivered later on the session's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Acceptance {
    pub accepted: bool,
}

impl Acceptance {
    pub fn accepted() -> Self {
        Self { accepted: true }
    }
}

/// Point-in-time view of relay load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthSnapshot {
    pub status: String,
    /// Sessions currently registered (open or draining)
    pub active_sessions: usize,
    /// Requests accepted but not yet answered on a stream
    pub in_flight_requests: usize,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}
