//! Health endpoint.

use axum::{extract::State, Json};
use mcp_relay_types::HealthSnapshot;

use crate::state::AppState;

/// GET /health - Point-in-time session and request counts.
///
/// Reads atomic counters only, so it never waits on the session registry.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Relay load snapshot", body = HealthSnapshot)
    )
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(HealthSnapshot {
        status: "ok".to_string(),
        active_sessions: state.registry().session_count(),
        in_flight_requests: state.registry().in_flight_count(),
    })
}
