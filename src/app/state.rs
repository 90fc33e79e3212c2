//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::RoomRegistry;
use crate::store::TokenStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub tokens: Arc<dyn TokenStore>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<RoomRegistry>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            tokens,
        }
    }
}
