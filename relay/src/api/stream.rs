//! Session stream endpoint.
//!
//! Opening the stream creates the session. The first event is always the
//! submission address; after that every reply queued on the session is
//! written as a `message` event in queue order, with keep-alive comments in
//! between so proxies do not drop a quiet connection.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use mcp_relay_types::api::{ENDPOINT_EVENT, MESSAGE_EVENT};
use mcp_relay_types::ErrorResponse;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::{api_error, api_error_with_details, submission_address, ApiError};
use crate::auth::AuthContext;
use crate::backend::validate_backend_url;
use crate::session::{CloseReason, SessionId, SessionRegistry};
use crate::state::AppState;

/// Query parameters of the stream-open endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Backend service this session relays to
    #[serde(alias = "backend_url")]
    pub backend: Option<String>,
}

/// Tears the session down when the stream is dropped.
///
/// axum drops the event stream when the client disconnects or a write fails,
/// and the stream also ends once the session channel is released, so this
/// runs on every exit path.
struct StreamGuard {
    registry: SessionRegistry,
    session_id: SessionId,
    drain_grace: Duration,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let grace = self.drain_grace;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!(session_id = %session_id, "Stream closed, draining session");
                    registry
                        .close_after_drain(&session_id, grace, CloseReason::ClientDisconnected)
                        .await;
                });
            }
            Err(_) => warn!(
                session_id = %session_id,
                "No runtime available to tear down session"
            ),
        }
    }
}

/// GET /sse - Open a session stream.
#[utoipa::path(
    get,
    path = "/sse",
    tag = "relay",
    params(
        ("backend" = String, Query, description = "Backend service URL to relay requests to")
    ),
    responses(
        (status = 200, description = "Event stream. The first `endpoint` event carries the submission address", content_type = "text/event-stream"),
        (status = 400, description = "Missing or invalid backend URL", body = ErrorResponse),
        (status = 401, description = "Missing or malformed credentials", body = ErrorResponse)
    )
)]
pub async fn open_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let auth = AuthContext::from_headers(&headers).map_err(|e| {
        warn!("Rejecting stream: {}", e);
        api_error_with_details(StatusCode::UNAUTHORIZED, "Authentication required", e)
    })?;

    let config = state.config();
    let backend_url =
        validate_backend_url(query.backend.as_deref(), &config.allowed_backend_hosts).map_err(
            |e| {
                warn!("Rejecting stream: {}", e);
                api_error(StatusCode::BAD_REQUEST, e.to_string())
            },
        )?;

    let registry = state.registry().clone();
    let (session, rx) = registry.create(auth, backend_url).await;
    let session_id = session.id().to_string();
    drop(session);

    let endpoint = submission_address(&config.public_base_path, &session_id);
    info!(session_id = %session_id, "Stream opened, announcing {}", endpoint);

    let guard = StreamGuard {
        registry: registry.clone(),
        session_id: session_id.clone(),
        drain_grace: config.drain_grace,
    };

    let handshake = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event(ENDPOINT_EVENT).data(endpoint))
    });

    let replies = UnboundedReceiverStream::new(rx).then(move |message| {
        // Owned by the closure, so it drops together with the stream
        let _guard = &guard;
        let registry = registry.clone();
        let session_id = session_id.clone();
        async move {
            registry.touch(&session_id).await;
            debug!(session_id = %session_id, "Writing reply to stream");
            Ok::<_, Infallible>(
                Event::default()
                    .event(MESSAGE_EVENT)
                    .data(message.into_payload()),
            )
        }
    });

    Ok(Sse::new(handshake.chain(replies)).keep_alive(
        KeepAlive::new()
            .interval(config.keep_alive)
            .text("keep-alive"),
    ))
}
