//! API handlers.
//!
//! ## Endpoints
//!
//! - `GET /sse?backend=<url>` - Open a session stream
//! - `POST /messages?sessionId=<id>` - Submit a JSON-RPC request for a session
//! - `DELETE /messages?sessionId=<id>` - Terminate a session
//! - `GET /health` - Session and in-flight counts

use axum::{http::StatusCode, Json};
use mcp_relay_types::api::SESSION_ID_PARAM;
use mcp_relay_types::ErrorResponse;

pub mod health;
pub mod messages;
pub mod stream;

/// Path of the stream-open endpoint.
pub const SSE_PATH: &str = "/sse";

/// Path of the submission endpoint.
pub const MESSAGES_PATH: &str = "/messages";

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

pub(crate) fn api_error_with_details(
    status: StatusCode,
    message: impl Into<String>,
    details: impl ToString,
) -> ApiError {
    (
        status,
        Json(ErrorResponse::with_details(message, details.to_string())),
    )
}

/// Submission address announced to the client in the `endpoint` event.
///
/// Derived from the session id alone, so a client can never need more than
/// the id to submit requests.
pub fn submission_address(base_path: &str, session_id: &str) -> String {
    format!("{base_path}{MESSAGES_PATH}?{SESSION_ID_PARAM}={session_id}")
}
