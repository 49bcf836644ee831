//! Leader lease
//!
//! Exactly one process per database may run watchers. The lease is taken
//! once at startup and held until shutdown.

use crate::db::DatabasePool;
use async_trait::async_trait;
use mailpulse_common::{Error, Result};
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::{info, warn};

/// Lock name for a database identity
pub fn lease_key(database: &str) -> String {
    format!("mailpulse-watchers:{}", database)
}

/// Cooperative distributed lock
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Try to take the lease without waiting. Returns whether it is now held.
    async fn acquire(&self) -> Result<bool>;

    fn is_held(&self) -> bool;

    async fn release(&self) -> Result<()>;
}

/// Postgres session-level advisory lock.
///
/// The lock lives as long as the session, so the connection is detached from
/// the pool and kept open for the lifetime of the lease.
pub struct PgAdvisoryLease {
    pool: DatabasePool,
    key: String,
    conn: tokio::sync::Mutex<Option<PgConnection>>,
    held: AtomicBool,
}

impl PgAdvisoryLease {
    pub fn new(pool: DatabasePool, database: &str) -> Self {
        Self {
            pool,
            key: lease_key(database),
            conn: tokio::sync::Mutex::new(None),
            held: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LeaderLease for PgAdvisoryLease {
    async fn acquire(&self) -> Result<bool> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(true);
        }

        let mut conn = self
            .pool
            .pool()
            .acquire()
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .detach();

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(&self.key)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if locked {
            info!(key = %self.key, "Leader lease acquired");
            *slot = Some(conn);
            self.held.store(true, Ordering::SeqCst);
        } else {
            info!(key = %self.key, "Leader lease held elsewhere, running as follower");
            if let Err(e) = conn.close().await {
                warn!("Failed to close lease connection: {}", e);
            }
        }

        Ok(locked)
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.held.store(false, Ordering::SeqCst);

        let Some(mut conn) = slot.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.key)
            .fetch_one(&mut conn)
            .await;

        // Closing the session drops the lock even if the unlock failed
        if let Err(e) = conn.close().await {
            warn!("Failed to close lease connection: {}", e);
        }

        match unlocked {
            Ok(_) => {
                info!(key = %self.key, "Leader lease released");
                Ok(())
            }
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }
}

fn local_leases() -> &'static Mutex<HashSet<String>> {
    static LEASES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    LEASES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// In-process lease for single-node deployments and tests.
///
/// Keys are unique per process: a second lease on the same key is refused
/// until the first is released.
pub struct LocalLease {
    key: String,
    held: AtomicBool,
}

impl LocalLease {
    pub fn new(database: &str) -> Self {
        Self {
            key: lease_key(database),
            held: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LeaderLease for LocalLease {
    async fn acquire(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let mut leases = local_leases()
            .lock()
            .map_err(|_| Error::Internal("lease registry poisoned".to_string()))?;
        let granted = leases.insert(self.key.clone());
        self.held.store(granted, Ordering::SeqCst);
        Ok(granted)
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(&self) -> Result<()> {
        if self.held.swap(false, Ordering::SeqCst) {
            let mut leases = local_leases()
                .lock()
                .map_err(|_| Error::Internal("lease registry poisoned".to_string()))?;
            leases.remove(&self.key);
        }
        Ok(())
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        if self.held.load(Ordering::SeqCst) {
            if let Ok(mut leases) = local_leases().lock() {
                leases.remove(&self.key);
            }
        }
    }
}
