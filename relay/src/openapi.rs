//! OpenAPI documentation configuration.

use mcp_relay_types::{
    Acceptance, ErrorResponse, HealthSnapshot, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::stream::open_stream,
        crate::api::messages::submit_message,
        crate::api::messages::close_session,
        crate::api::health::health,
    ),
    components(
        schemas(
            Acceptance,
            ErrorResponse,
            HealthSnapshot,
            JsonRpcRequest,
            JsonRpcResponse,
            JsonRpcError,
        )
    ),
    tags(
        (name = "relay", description = "Session streams and request submission"),
        (name = "health", description = "Operational monitoring")
    ),
    info(
        title = "MCP Relay API",
        description = "Relays streaming MCP clients to request/response HTTP backends"
    )
)]
pub struct ApiDoc;
