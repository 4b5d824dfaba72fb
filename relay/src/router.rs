//! JSON-RPC method routing.
//!
//! Decides per method whether the relay answers locally or forwards to the
//! backend, and turns every outcome into exactly one reply for requests that
//! carry an id.

use mcp_relay_types::jsonrpc::error_codes;
use mcp_relay_types::{JsonRpcRequest, JsonRpcResponse};
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::AuthContext;
use crate::backend::Backend;
use crate::session::{Session, SessionId, SessionRegistry};

/// Liveness check, answered locally.
pub const METHOD_PING: &str = "ping";
/// Resource listing, answered locally with an empty list.
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
/// Handshake, forwarded and augmented with relay capabilities.
pub const METHOD_INITIALIZE: &str = "initialize";

/// How a method is handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Answered by the relay with this result
    Local(Value),
    /// Forwarded, capabilities merged into the reply
    ForwardAndMerge,
    /// Forwarded verbatim
    Forward,
}

impl Route {
    pub fn for_method(method: &str) -> Self {
        match method {
            METHOD_PING => Self::Local(json!({})),
            METHOD_RESOURCES_LIST => Self::Local(json!({ "resources": [] })),
            METHOD_INITIALIZE => Self::ForwardAndMerge,
            _ => Self::Forward,
        }
    }
}

/// A submitted request on its way to a reply.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub session_id: SessionId,
    /// Correlation id the reply must carry
    pub request_id: Option<Value>,
    pub method: String,
}

impl PendingRequest {
    pub fn new(session_id: impl Into<SessionId>, request: &JsonRpcRequest) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request.id.clone(),
            method: request.method.clone(),
        }
    }
}

/// Routes requests to a local answer or the backend.
#[derive(Clone)]
pub struct MethodRouter {
    backend: Arc<dyn Backend>,
    /// Capability flags the relay adds to `initialize` replies
    capabilities: Value,
}

impl MethodRouter {
    pub fn new(backend: Arc<dyn Backend>, capabilities: Value) -> Self {
        Self {
            backend,
            capabilities,
        }
    }

    /// Produce the reply for one request.
    ///
    /// Returns `None` for notifications. Backend failures become JSON-RPC
    /// error replies and never escape as errors.
    pub async fn handle(
        &self,
        backend_url: &Url,
        auth: &AuthContext,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let request_id = request.id.clone();
        let notification = request.is_notification();

        let merge = match Route::for_method(&request.method) {
            Route::Local(result) => {
                debug!(method = %request.method, "Answering locally");
                return (!notification).then(|| JsonRpcResponse::success(request_id, result));
            }
            Route::ForwardAndMerge => true,
            Route::Forward => false,
        };

        let outcome = self.backend.call(backend_url, auth, &request).await;
        if notification {
            if let Err(e) = outcome {
                warn!(
                    method = %request.method,
                    kind = e.kind(),
                    "Backend rejected notification: {}",
                    e
                );
            }
            return None;
        }

        let reply = match outcome {
            Ok(Some(reply)) => {
                let mut reply = reply.with_id(request_id);
                if merge {
                    self.merge_capabilities(&mut reply);
                }
                reply
            }
            Ok(None) => JsonRpcResponse::error_with_data(
                request_id,
                error_codes::INTERNAL_ERROR,
                "Backend returned no reply",
                json!({ "kind": "malformed_reply" }),
            ),
            Err(e) => {
                warn!(
                    method = %request.method,
                    kind = e.kind(),
                    "Backend call failed: {}",
                    e
                );
                e.into_response(request_id)
            }
        };
        Some(reply)
    }

    /// Handle a request in the background and queue its reply on the session.
    ///
    /// The request counts as in flight until the reply is queued. Only the
    /// session id is carried across the backend call; the reply is handed
    /// back through the registry, which discards it if the session is gone.
    pub fn spawn_dispatch(
        &self,
        registry: SessionRegistry,
        session: &Arc<Session>,
        request: JsonRpcRequest,
    ) {
        let guard = registry.track_request(session);
        let pending = PendingRequest::new(session.id(), &request);
        let backend_url = session.backend_url().clone();
        let auth = session.auth().clone();
        let router = self.clone();

        tokio::spawn(async move {
            let _guard = guard;
            if let Some(reply) = router.handle(&backend_url, &auth, request).await {
                debug!(
                    session_id = %pending.session_id,
                    method = %pending.method,
                    error = reply.is_error(),
                    "Queueing reply"
                );
                registry.deliver(&pending.session_id, reply).await;
            }
        });
    }

    fn merge_capabilities(&self, reply: &mut JsonRpcResponse) {
        let Some(Value::Object(result)) = reply.result.as_mut() else {
            return;
        };
        let capabilities = result
            .entry("capabilities")
            .or_insert_with(|| json!({}));
        if !capabilities.is_object() {
            *capabilities = json!({});
        }
        merge_json(capabilities, &self.capabilities);
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key, anything else
/// in `overlay` replaces what is in `base`.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Script =
        Box<dyn Fn(&JsonRpcRequest) -> Result<Option<JsonRpcResponse>, BackendError> + Send + Sync>;

    /// Scripted backend that records what reached it.
    struct FakeBackend {
        reply: Script,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new(
            reply: impl Fn(&JsonRpcRequest) -> Result<Option<JsonRpcResponse>, BackendError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                reply: Box::new(reply),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn call(
            &self,
            _backend_url: &Url,
            _auth: &AuthContext,
            request: &JsonRpcRequest,
        ) -> Result<Option<JsonRpcResponse>, BackendError> {
            self.calls.lock().push(request.method.clone());
            (self.reply)(request)
        }
    }

    fn url() -> Url {
        Url::parse("http://backend.test/mcp").unwrap()
    }

    fn auth() -> AuthContext {
        AuthContext::Bearer("t".to_string())
    }

    fn router(backend: Arc<FakeBackend>) -> MethodRouter {
        MethodRouter::new(backend, json!({ "experimental": { "relay": { "streaming": true } } }))
    }

    #[test]
    fn test_route_classification() {
        assert_eq!(Route::for_method("ping"), Route::Local(json!({})));
        assert_eq!(
            Route::for_method("resources/list"),
            Route::Local(json!({"resources": []}))
        );
        assert_eq!(Route::for_method("initialize"), Route::ForwardAndMerge);
        assert_eq!(Route::for_method("tools/call"), Route::Forward);
    }

    #[tokio::test]
    async fn test_ping_never_reaches_backend() {
        let backend = FakeBackend::new(|_| Err(BackendError::Unreachable("down".to_string())));
        let router = router(backend.clone());

        let reply = router
            .handle(&url(), &auth(), JsonRpcRequest::new(1, "ping"))
            .await
            .unwrap();

        assert_eq!(reply.id, Some(json!(1)));
        assert_eq!(reply.result, Some(json!({})));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resources_list_is_empty_stub() {
        let backend = FakeBackend::new(|_| panic!("must not be called"));
        let reply = router(backend)
            .handle(&url(), &auth(), JsonRpcRequest::new("r", "resources/list"))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(json!({"resources": []})));
    }

    #[tokio::test]
    async fn test_forward_reattaches_request_id() {
        let backend = FakeBackend::new(|_| {
            Ok(Some(JsonRpcResponse::success(
                Some(json!("backend-id")),
                json!({"tools": [{"name": "get_doc"}]}),
            )))
        });
        let router = router(backend.clone());

        let reply = router
            .handle(&url(), &auth(), JsonRpcRequest::new(2, "tools/list"))
            .await
            .unwrap();

        assert_eq!(reply.id, Some(json!(2)));
        assert_eq!(reply.result, Some(json!({"tools": [{"name": "get_doc"}]})));
        assert_eq!(backend.calls(), vec!["tools/list".to_string()]);
    }

    #[tokio::test]
    async fn test_backend_error_reply_passes_through() {
        let backend = FakeBackend::new(|r| {
            Ok(Some(JsonRpcResponse::error(
                r.id.clone(),
                -32602,
                "Missing doctype",
            )))
        });
        let reply = router(backend)
            .handle(&url(), &auth(), JsonRpcRequest::new(3, "tools/call"))
            .await
            .unwrap();
        let error = reply.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.message, "Missing doctype");
    }

    #[tokio::test]
    async fn test_timeout_becomes_single_error_reply() {
        let backend =
            FakeBackend::new(|_| Err(BackendError::Timeout(Duration::from_millis(250))));
        let reply = router(backend.clone())
            .handle(&url(), &auth(), JsonRpcRequest::new(4, "tools/call"))
            .await
            .unwrap();

        assert_eq!(reply.id, Some(json!(4)));
        let error = reply.error.unwrap();
        assert_eq!(error.code, error_codes::BACKEND_TIMEOUT);
        assert_eq!(error.data.unwrap()["kind"], "timeout");
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_backend_reply_for_request_is_error() {
        let backend = FakeBackend::new(|_| Ok(None));
        let reply = router(backend)
            .handle(&url(), &auth(), JsonRpcRequest::new(5, "tools/call"))
            .await
            .unwrap();
        assert_eq!(reply.error.unwrap().code, error_codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_notification_is_forwarded_without_reply() {
        let backend = FakeBackend::new(|_| Ok(None));
        let router = router(backend.clone());

        let reply = router
            .handle(
                &url(),
                &auth(),
                JsonRpcRequest::notification("notifications/initialized"),
            )
            .await;

        assert!(reply.is_none());
        assert_eq!(backend.calls(), vec!["notifications/initialized".to_string()]);
    }

    #[tokio::test]
    async fn test_null_id_request_gets_exactly_one_reply() {
        let backend = FakeBackend::new(|_| Err(BackendError::Timeout(Duration::from_millis(10))));
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": null, "method": "tools/call"}))
                .unwrap();

        let reply = router(backend.clone())
            .handle(&url(), &auth(), request)
            .await
            .expect("a request with a null id is not a notification");

        assert_eq!(reply.id, Some(Value::Null));
        assert_eq!(reply.error.unwrap().code, error_codes::BACKEND_TIMEOUT);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_merges_relay_capabilities() {
        let backend = FakeBackend::new(|r| {
            Ok(Some(JsonRpcResponse::success(
                r.id.clone(),
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {
                        "tools": { "listChanged": false },
                        "experimental": { "backend": true }
                    },
                    "serverInfo": { "name": "erp", "version": "1.0" }
                }),
            )))
        });

        let reply = router(backend)
            .handle(&url(), &auth(), JsonRpcRequest::new(0, "initialize"))
            .await
            .unwrap();

        let capabilities = &reply.result.unwrap()["capabilities"];
        assert_eq!(capabilities["tools"], json!({ "listChanged": false }));
        assert_eq!(capabilities["experimental"]["backend"], true);
        assert_eq!(capabilities["experimental"]["relay"]["streaming"], true);
    }

    #[tokio::test]
    async fn test_initialize_without_capabilities_gets_relay_flags() {
        let backend = FakeBackend::new(|r| {
            Ok(Some(JsonRpcResponse::success(
                r.id.clone(),
                json!({ "protocolVersion": "2024-11-05" }),
            )))
        });
        let reply = router(backend)
            .handle(&url(), &auth(), JsonRpcRequest::new(0, "initialize"))
            .await
            .unwrap();
        assert_eq!(
            reply.result.unwrap()["capabilities"]["experimental"]["relay"]["streaming"],
            true
        );
    }

    #[tokio::test]
    async fn test_spawn_dispatch_queues_reply_on_session() {
        let backend =
            FakeBackend::new(|r| Ok(Some(JsonRpcResponse::success(r.id.clone(), json!(42)))));
        let router = router(backend);
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.create(auth(), url()).await;

        router.spawn_dispatch(
            registry.clone(),
            &session,
            JsonRpcRequest::new(7, "tools/call"),
        );

        let message = rx.recv().await.unwrap();
        let reply: JsonRpcResponse = serde_json::from_str(message.payload()).unwrap();
        assert_eq!(reply.id, Some(json!(7)));
        assert_eq!(reply.result, Some(json!(42)));

        // Guard is released once the dispatch task finishes
        for _ in 0..10 {
            if registry.in_flight_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn test_merge_json() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_json(&mut base, &json!({"a": {"c": 20, "e": 5}, "d": {"x": true}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 20, "e": 5}, "d": {"x": true}}));
    }
}
