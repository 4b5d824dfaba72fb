//! JSON-RPC 2.0 message model.
//!
//! Requests arrive on the submission endpoint, replies travel back on the
//! session's event stream. The `id` of a request is echoed unchanged on its
//! reply, including an explicit `null`; only requests with no `id` member at
//! all are notifications and get no reply.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the relay.
pub mod error_codes {
    /// Also used for backend replies that could not be understood.
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const BACKEND_TIMEOUT: i32 = -32001;
    pub const BACKEND_UNREACHABLE: i32 = -32002;
    pub const BACKEND_HTTP_STATUS: i32 = -32003;
}

/// JSON-RPC 2.0 Request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[cfg_attr(feature = "validation", derive(garde::Validate))]
pub struct JsonRpcRequest {
    #[cfg_attr(feature = "validation", garde(custom(validate_version)))]
    pub jsonrpc: String,
    /// `None` when the member is absent; a literal `null` is `Some(Value::Null)`
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    #[cfg_attr(feature = "validation", garde(skip))]
    pub id: Option<Value>,
    #[cfg_attr(feature = "validation", garde(length(min = 1)))]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "validation", garde(skip))]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with the given id and method.
    pub fn new(id: impl Into<Value>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: None,
        }
    }

    /// Create a notification (a request that expects no reply).
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    /// Notifications carry no id and never produce a reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Only called when the member is present, so `null` is kept as a value.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(feature = "validation")]
fn validate_version(value: &str, _ctx: &()) -> garde::Result {
    if value == JSONRPC_VERSION {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "unsupported protocol version `{value}`, expected `{JSONRPC_VERSION}`"
        )))
    }
}

/// JSON-RPC 2.0 Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Create an error response with data.
    pub fn error_with_data(
        id: Option<Value>,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        }
    }

    /// Replace the correlation id, keeping the payload untouched.
    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC 2.0 Error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
