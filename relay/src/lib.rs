//! MCP relay library.
//!
//! This module exposes the application builder for use in tests.

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod janitor;
pub mod openapi;
pub mod router;
pub mod session;
pub mod state;

use backend::BackendError;
use config::Config;
use state::AppState;

/// Create the Axum application router, forwarding to backends over HTTP.
pub fn create_app(config: Config) -> Result<Router, BackendError> {
    Ok(create_app_with_state(AppState::from_config(config)?))
}

/// Create the Axum application router with a given state.
///
/// This function is used both by the main server binary and by integration tests.
pub fn create_app_with_state(state: AppState) -> Router {
    let cors_allowed_origins = state.config().cors_allowed_origins.clone();

    let relay_router = Router::new()
        .route(api::SSE_PATH, get(api::stream::open_stream))
        .route(
            api::MESSAGES_PATH,
            post(api::messages::submit_message).delete(api::messages::close_session),
        )
        .route("/health", get(api::health::health));

    Router::new()
        .merge(relay_router)
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::ACCEPT,
                    HeaderName::from_static(auth::API_KEY_HEADER),
                ]);

            // If no origins specified, allow any origin
            if cors_allowed_origins.is_empty() {
                cors.allow_origin(Any)
            } else {
                let origins: Vec<HeaderValue> = cors_allowed_origins
                    .iter()
                    .filter_map(|o| o.parse::<HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins).allow_credentials(true)
            }
        })
        .with_state(state)
}
