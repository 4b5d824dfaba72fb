//! Application state management.

use std::sync::Arc;

use crate::backend::{Backend, BackendError, HttpBackend};
use crate::config::Config;
use crate::router::MethodRouter;
use crate::session::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// All relay sessions
    registry: SessionRegistry,
    /// Local answers and backend forwarding
    router: MethodRouter,
    config: Config,
}

impl AppState {
    /// Create application state around the given backend.
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Self {
        let router = MethodRouter::new(backend, config.capabilities.clone());
        Self {
            inner: Arc::new(AppStateInner {
                registry: SessionRegistry::new(),
                router,
                config,
            }),
        }
    }

    /// Create application state that forwards over HTTP.
    pub fn from_config(config: Config) -> Result<Self, BackendError> {
        let backend = HttpBackend::new(config.backend_timeout)?;
        Ok(Self::new(config, Arc::new(backend)))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn router(&self) -> &MethodRouter {
        &self.inner.router
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
