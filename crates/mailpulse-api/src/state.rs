//! Shared handler state

use mailpulse_core::{ManagerRegistry, SubscriptionManager};
use mailpulse_storage::{AccountRepositoryTrait, DatabasePool};
use std::sync::Arc;

use crate::error::ApiError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database identity served by this process
    pub database: String,
    pub registry: Arc<ManagerRegistry>,
    pub accounts: Arc<dyn AccountRepositoryTrait>,
    /// Checked by the readiness probe; `None` skips the check
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    /// Manager of the served database, started on first use
    pub async fn manager(&self) -> Result<Arc<SubscriptionManager>, ApiError> {
        self.registry
            .get_or_start(&self.database)
            .await
            .map_err(|e| ApiError::ManagerUnavailable(e.to_string()))
    }
}
