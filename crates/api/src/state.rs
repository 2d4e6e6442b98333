use std::sync::Arc;

use taskrelay_core::jobs::{JobQueue, StatusStore};
use taskrelay_events::ChannelRegistry;

use crate::config::ServerConfig;
use crate::ws::SessionManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: everything sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Live task channels and their upstream subscriptions.
    pub registry: Arc<ChannelRegistry>,
    /// Connected WebSocket sessions.
    pub sessions: Arc<SessionManager>,
    /// Job submission boundary.
    pub jobs: Arc<dyn JobQueue>,
    /// Task status boundary.
    pub statuses: Arc<dyn StatusStore>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        registry: Arc<ChannelRegistry>,
        jobs: Arc<dyn JobQueue>,
        statuses: Arc<dyn StatusStore>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            config.session_config(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            sessions,
            jobs,
            statuses,
        }
    }
}
