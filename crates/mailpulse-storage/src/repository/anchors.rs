//! Sync anchor repository
//!
//! Anchors are written by exactly one watcher per account, so plain row
//! updates are enough.

use crate::db::DatabasePool;
use async_trait::async_trait;
use mailpulse_common::types::AccountId;
use mailpulse_common::{Error, Result};
use std::collections::HashMap;

/// Durable anchor store
#[async_trait]
pub trait AnchorRepository: Send + Sync {
    async fn get_history_id(&self, account_id: AccountId) -> Result<Option<String>>;
    async fn set_history_id(&self, account_id: AccountId, history_id: &str) -> Result<()>;
    async fn get_delta_tokens(&self, account_id: AccountId) -> Result<HashMap<String, String>>;
    async fn set_delta_tokens(
        &self,
        account_id: AccountId,
        tokens: &HashMap<String, String>,
    ) -> Result<()>;
}

/// Database anchor repository
pub struct DbAnchorRepository {
    pool: DatabasePool,
}

impl DbAnchorRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnchorRepository for DbAnchorRepository {
    async fn get_history_id(&self, account_id: AccountId) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT gmail_last_history_id FROM mail_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(value.flatten().filter(|v| !v.is_empty()))
    }

    async fn set_history_id(&self, account_id: AccountId, history_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE mail_accounts SET gmail_last_history_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .bind(history_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_delta_tokens(&self, account_id: AccountId) -> Result<HashMap<String, String>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT outlook_delta_tokens FROM mail_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        match value {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(HashMap::new()),
        }
    }

    async fn set_delta_tokens(
        &self,
        account_id: AccountId,
        tokens: &HashMap<String, String>,
    ) -> Result<()> {
        let value = serde_json::to_value(tokens)?;
        sqlx::query(
            "UPDATE mail_accounts SET outlook_delta_tokens = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .bind(value)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
