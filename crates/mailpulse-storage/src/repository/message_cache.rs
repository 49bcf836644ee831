//! Message cache repository
//!
//! Holds display metadata for enrichment, the last known parent folder of
//! vendor messages and the flag/removal overlay read by higher layers.

use crate::db::DatabasePool;
use crate::models::CachedMessage;
use async_trait::async_trait;
use mailpulse_common::types::{AccountId, FlagState, MessageMeta, MessageUid};
use mailpulse_common::{Error, Result};
use std::collections::BTreeMap;

/// Message cache repository trait
#[async_trait]
pub trait MessageCacheRepository: Send + Sync {
    /// Cached metadata for `uids`; a `None` folder matches any folder
    async fn message_meta(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMeta>>;

    async fn update_flags(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        flags: &BTreeMap<MessageUid, FlagState>,
    ) -> Result<()>;

    async fn remove_uids(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        uids: &[MessageUid],
    ) -> Result<()>;

    async fn get_parent_folder(
        &self,
        account_id: AccountId,
        message_id: &str,
    ) -> Result<Option<String>>;

    async fn set_parent_folder(
        &self,
        account_id: AccountId,
        message_id: &str,
        folder_id: &str,
    ) -> Result<()>;
}

/// Database message cache repository
pub struct DbMessageCacheRepository {
    pool: DatabasePool,
}

impl DbMessageCacheRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageCacheRepository for DbMessageCacheRepository {
    async fn message_meta(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        uids: &[MessageUid],
    ) -> Result<Vec<MessageMeta>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, CachedMessage>(
            r#"
            SELECT account_id, folder, uid, subject, from_addr, to_addr, date, message_id, seen, starred, removed
            FROM mail_message_cache
            WHERE account_id = $1 AND ($2::text IS NULL OR folder = $2) AND uid = ANY($3) AND NOT removed
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(uids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(MessageMeta::from).collect())
    }

    async fn update_flags(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        flags: &BTreeMap<MessageUid, FlagState>,
    ) -> Result<()> {
        if flags.is_empty() {
            return Ok(());
        }

        let uids: Vec<String> = flags.keys().cloned().collect();
        let seen: Vec<Option<bool>> = flags.values().map(|f| f.seen).collect();
        let starred: Vec<Option<bool>> = flags.values().map(|f| f.starred).collect();

        sqlx::query(
            r#"
            UPDATE mail_message_cache AS c
            SET seen = COALESCE(u.seen, c.seen),
                starred = COALESCE(u.starred, c.starred),
                updated_at = NOW()
            FROM UNNEST($3::text[], $4::bool[], $5::bool[]) AS u(uid, seen, starred)
            WHERE c.account_id = $1 AND ($2::text IS NULL OR c.folder = $2) AND c.uid = u.uid
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(&uids)
        .bind(&seen)
        .bind(&starred)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn remove_uids(
        &self,
        account_id: AccountId,
        folder: Option<&str>,
        uids: &[MessageUid],
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE mail_message_cache
            SET removed = TRUE, updated_at = NOW()
            WHERE account_id = $1 AND ($2::text IS NULL OR folder = $2) AND uid = ANY($3)
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(uids)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_parent_folder(
        &self,
        account_id: AccountId,
        message_id: &str,
    ) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT folder_id FROM mail_parent_folders WHERE account_id = $1 AND message_id = $2",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_parent_folder(
        &self,
        account_id: AccountId,
        message_id: &str,
        folder_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mail_parent_folders (account_id, message_id, folder_id, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (account_id, message_id)
            DO UPDATE SET folder_id = EXCLUDED.folder_id, updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(message_id)
        .bind(folder_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
