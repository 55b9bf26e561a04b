//! Gateway shared state.

use std::sync::Arc;

use cartwheel_agents::GraphRuntime;
use cartwheel_core::config::Config;
use cartwheel_core::stores::{ChatStore, MessageStore, TokenAuth};
use cartwheel_search::SearchEngine;

use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn TokenAuth>,
    pub runtime: Arc<GraphRuntime>,
    /// Direct engine handle for requests served outside a graph turn
    /// (product details).
    pub engine: Arc<SearchEngine>,
    pub limits: Arc<RateLimiter>,
    pub chats: Arc<dyn ChatStore>,
    pub messages: Arc<dyn MessageStore>,
    pub sessions: SessionManager,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn TokenAuth>,
        runtime: Arc<GraphRuntime>,
        engine: Arc<SearchEngine>,
        limits: Arc<RateLimiter>,
        chats: Arc<dyn ChatStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config,
            auth,
            runtime,
            engine,
            limits,
            chats,
            messages,
            sessions: SessionManager::new(),
        }
    }
}
