//! Shared bus repository
//!
//! Every batch is written in a single transaction. Listeners are woken with
//! a `pg_notify` carrying the row id and channel, so payload size never hits
//! the NOTIFY limit.

use crate::db::DatabasePool;
use crate::models::BusMessage;
use async_trait::async_trait;
use mailpulse_common::{Error, Result};
use tracing::{debug, warn};

/// Postgres NOTIFY channel used for bus wake-ups
pub const NOTIFY_CHANNEL: &str = "mailpulse_bus";

/// Shared bus trait
#[async_trait]
pub trait BusRepository: Send + Sync {
    /// Publish all messages atomically; nothing is visible if any write fails
    async fn publish_batch(&self, messages: &[BusMessage]) -> Result<()>;
}

/// Database bus repository
pub struct DbBusRepository {
    pool: DatabasePool,
}

impl DbBusRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BusRepository for DbBusRepository {
    async fn publish_batch(&self, messages: &[BusMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::PublisherWrite(format!("begin failed: {}", e)))?;

        for message in messages {
            let written = async {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO bus_events (channel, message, created_at) VALUES ($1, $2, NOW()) RETURNING id",
                )
                .bind(&message.channel)
                .bind(&message.payload)
                .fetch_one(&mut *tx)
                .await?;

                let notice = serde_json::json!({ "id": id, "channel": message.channel });
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(NOTIFY_CHANNEL)
                    .bind(notice.to_string())
                    .execute(&mut *tx)
                    .await?;
                Ok::<(), sqlx::Error>(())
            }
            .await;

            if let Err(e) = written {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Bus rollback failed: {}", rollback);
                }
                return Err(Error::PublisherWrite(e.to_string()));
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::PublisherWrite(format!("commit failed: {}", e)))?;

        debug!(count = messages.len(), "Bus batch committed");
        Ok(())
    }
}
