//! Mail account repository

use crate::db::DatabasePool;
use crate::models::{AccountConfig, MailAccount};
use async_trait::async_trait;
use mailpulse_common::types::{AccountId, ProviderKind};
use mailpulse_common::{Error, Result};
use std::collections::HashMap;

/// Account configuration provider
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn exists(&self, id: AccountId) -> Result<bool>;
    /// Connection settings for a watcher; `NotFound` if the account is gone
    async fn load_config(&self, id: AccountId) -> Result<AccountConfig>;
    /// Provider kinds of the accounts that still exist
    async fn provider_kinds(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, ProviderKind>>;
}

/// Database account repository
pub struct DbAccountRepository {
    pool: DatabasePool,
}

impl DbAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: AccountId) -> Result<Option<MailAccount>> {
        sqlx::query_as::<_, MailAccount>("SELECT * FROM mail_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl AccountRepository for DbAccountRepository {

    async fn exists(&self, id: AccountId) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM mail_accounts WHERE id = $1)")
            .bind(id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn load_config(&self, id: AccountId) -> Result<AccountConfig> {
        let account = self
            .fetch(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mail account {}", id)))?;
        account.to_config()
    }

    async fn provider_kinds(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, ProviderKind>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(AccountId, String)> =
            sqlx::query_as("SELECT id, server_kind FROM mail_accounts WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, kind)| (id, ProviderKind::from_server_kind(&kind)))
            .collect())
    }
}
