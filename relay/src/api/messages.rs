//! Request submission endpoint.
//!
//! A submission is acknowledged immediately; the reply travels later on the
//! session's stream. Failures that happen before the request is accepted
//! (unknown session, bad body, wrong credential) are returned here, anything
//! after that is delivered on the stream.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use garde::Validate;
use mcp_relay_types::{Acceptance, ErrorResponse, JsonRpcRequest};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{api_error, api_error_with_details, ApiError};
use crate::auth::AuthContext;
use crate::session::{CloseReason, Session};
use crate::state::AppState;

/// Query parameters of the submission endpoint.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
}

#[allow(clippy::result_large_err)]
fn require_session_id(query: &SessionQuery) -> Result<&str, ApiError> {
    query
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Missing sessionId parameter"))
}

fn unknown_session() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Unknown or expired session")
}

/// Check the caller presents the credential the session was opened with.
#[allow(clippy::result_large_err)]
fn authorize(session: &Session, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = AuthContext::from_headers(headers).map_err(|e| {
        api_error_with_details(StatusCode::UNAUTHORIZED, "Authentication required", e)
    })?;

    if &presented != session.auth() {
        warn!(session_id = %session.id(), "Credential does not match session");
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Credential does not match the session",
        ));
    }
    Ok(())
}

/// Parse and validate a single JSON-RPC request body.
#[allow(clippy::result_large_err)]
fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, ApiError> {
    let request: JsonRpcRequest = serde_json::from_slice(body).map_err(|e| {
        api_error_with_details(StatusCode::BAD_REQUEST, "Malformed request", e)
    })?;
    request.validate().map_err(|report| {
        api_error_with_details(StatusCode::BAD_REQUEST, "Invalid request", report)
    })?;
    Ok(request)
}

/// POST /messages - Submit a JSON-RPC request for a session.
#[utoipa::path(
    post,
    path = "/messages",
    tag = "relay",
    params(
        ("sessionId" = String, Query, description = "Session id from the stream's endpoint event")
    ),
    request_body = JsonRpcRequest,
    responses(
        (status = 202, description = "Accepted; the reply is delivered on the session stream", body = Acceptance),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 401, description = "Missing or malformed credentials", body = ErrorResponse),
        (status = 403, description = "Credential does not match the session", body = ErrorResponse),
        (status = 404, description = "Unknown or expired session", body = ErrorResponse)
    )
)]
pub async fn submit_message(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Acceptance>), ApiError> {
    let session_id = require_session_id(&query)?;

    let session: Arc<Session> = match state.registry().get_open(session_id).await {
        Some(session) => session,
        None => {
            debug!(session_id = %session_id, "Submission for unknown session");
            return Err(unknown_session());
        }
    };

    authorize(&session, &headers)?;

    let request = parse_request(&body).map_err(|e| {
        warn!(session_id = %session_id, "Rejecting submission: {}", e.1.error);
        e
    })?;

    session.touch();
    debug!(
        session_id = %session_id,
        method = %request.method,
        id = ?request.id,
        "Accepted submission"
    );
    state
        .router()
        .spawn_dispatch(state.registry().clone(), &session, request);

    Ok((StatusCode::ACCEPTED, Json(Acceptance::accepted())))
}

/// DELETE /messages - Terminate a session.
#[utoipa::path(
    delete,
    path = "/messages",
    tag = "relay",
    params(
        ("sessionId" = String, Query, description = "Session id to terminate")
    ),
    responses(
        (status = 204, description = "Session terminated"),
        (status = 401, description = "Missing or malformed credentials", body = ErrorResponse),
        (status = 403, description = "Credential does not match the session", body = ErrorResponse),
        (status = 404, description = "Unknown or expired session", body = ErrorResponse)
    )
)]
pub async fn close_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session_id = require_session_id(&query)?;

    let Some(session) = state.registry().get(session_id).await else {
        return Err(unknown_session());
    };
    authorize(&session, &headers)?;
    drop(session);

    if state
        .registry()
        .remove(session_id, CloseReason::ClientRequested)
        .await
    {
        info!(session_id = %session_id, "Session terminated by client");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(unknown_session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_accepts_valid_request() {
        let body = serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .unwrap();
        let request = parse_request(&body).unwrap();
        assert_eq!(request.method, "ping");
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        let (status, Json(error)) = parse_request(b"{not json").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "Malformed request");
    }

    #[test]
    fn test_parse_request_rejects_batches() {
        let body =
            serde_json::to_vec(&json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}])).unwrap();
        assert!(parse_request(&body).is_err());
    }

    #[test]
    fn test_parse_request_rejects_wrong_version() {
        let body = serde_json::to_vec(&json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
            .unwrap();
        let (status, Json(error)) = parse_request(&body).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "Invalid request");
    }

    #[test]
    fn test_require_session_id() {
        let missing = SessionQuery { session_id: None };
        assert_eq!(require_session_id(&missing).unwrap_err().0, StatusCode::BAD_REQUEST);

        let empty = SessionQuery {
            session_id: Some(String::new()),
        };
        assert!(require_session_id(&empty).is_err());

        let present = SessionQuery {
            session_id: Some("abc".to_string()),
        };
        assert_eq!(require_session_id(&present).unwrap(), "abc");
    }
}
