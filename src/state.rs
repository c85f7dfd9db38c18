//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::AccessTokenAuthorizer;
use crate::config::Config;
use crate::connector::DeviceConnector;
use crate::repository::IdentityRepository;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live channel sessions and their statistics.
    pub connector: Arc<DeviceConnector>,
    /// Token lookup for controllers and HTTP callers.
    pub authorizer: AccessTokenAuthorizer,
    /// Fires on process shutdown; in-flight tunneled requests are cancelled.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, repository: Arc<dyn IdentityRepository>) -> Self {
        let connector = DeviceConnector::new(config.connector.to_session_options());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            connector: Arc::new(connector),
            authorizer: AccessTokenAuthorizer::new(repository),
            shutdown: CancellationToken::new(),
        }
    }
}
