use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::identity::IdentityManager;
use crate::session::SessionManager;

/// Shared process state injected into every handler.
pub struct AppState {
    pub session_manager: SessionManager,
    pub identity: IdentityManager,
    pub http_client: reqwest::Client,
    pub concurrency: Arc<Semaphore>,
    pub config: Config,
}
