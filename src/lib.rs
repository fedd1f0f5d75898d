pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod identity;
pub mod limiter;
pub mod rest;
pub mod session;

use std::sync::Arc;

use anyhow::Result;

use config::RelayConfig;
use dispatch::DispatchController;
use gateway::{Gateway, HttpGateway};
use limiter::SlidingWindowLimiter;
use session::SessionStore;

/// Shared application state passed to every HTTP handler.
///
/// Explicitly constructed in `main` and handed around by `Arc`. Tests build
/// isolated instances with their own limiter and a mock gateway.
pub struct AppContext {
    pub config: Arc<RelayConfig>,
    pub dispatcher: Arc<DispatchController>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire up the production context: HTTP gateway, fresh limiter, empty
    /// session store.
    pub fn new(config: Arc<RelayConfig>) -> Result<Self> {
        let gateway = Arc::new(HttpGateway::new(
            config.backend_url.clone(),
            config.backend_api_key.clone(),
            config.call_timeout_seconds,
        )?);
        Ok(Self::with_gateway(config, gateway))
    }

    /// Context with an injected gateway, used by tests.
    pub fn with_gateway(config: Arc<RelayConfig>, gateway: Arc<dyn Gateway>) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::new(config.limiter.clone()));
        let sessions = Arc::new(SessionStore::new());
        let dispatcher = Arc::new(DispatchController::new(limiter, sessions, gateway));
        Self {
            config,
            dispatcher,
            started_at: std::time::Instant::now(),
        }
    }
}
