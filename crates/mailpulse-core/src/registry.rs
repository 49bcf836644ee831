//! Process-wide registry of subscription managers, one per database

use crate::manager::SubscriptionManager;
use crate::publisher::{EventPublisher, PublisherDeps};
use crate::strategy::{DefaultStrategyFactory, StrategyFactory};
use crate::watcher::WatcherDeps;
use async_trait::async_trait;
use mailpulse_common::config::Config;
use mailpulse_common::Result;
use mailpulse_storage::{
    AccountRepository, AnchorRepository, BusRepository, DatabasePool, MessageCacheRepository,
    PgAdvisoryLease,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Connections reserved for the watchers of one database
const WATCHER_CONNECTIONS: u32 = 4;

/// Builds the manager for a database on first use
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    async fn create(&self, database: &str) -> Result<SubscriptionManager>;
}

/// Postgres-backed managers.
///
/// Watchers and the publisher each get their own lazily connecting pool so
/// their connections are driven by their own worker runtimes. The lease
/// detaches a connection from the shared pool.
pub struct PgManagerFactory {
    config: Arc<Config>,
    pool: DatabasePool,
    strategies: Arc<dyn StrategyFactory>,
}

impl PgManagerFactory {
    pub fn new(config: Arc<Config>, pool: DatabasePool) -> Self {
        let strategies = Arc::new(DefaultStrategyFactory::new(config.clone()));
        Self {
            config,
            pool,
            strategies,
        }
    }
}

#[async_trait]
impl ManagerFactory for PgManagerFactory {
    async fn create(&self, database: &str) -> Result<SubscriptionManager> {
        let watch_pool = DatabasePool::dedicated(&self.config.database, WATCHER_CONNECTIONS)?;
        let bus_pool = DatabasePool::dedicated(&self.config.database, 1)?;

        let deps = Arc::new(WatcherDeps {
            accounts: Arc::new(AccountRepository::new(watch_pool.clone())),
            anchors: Arc::new(AnchorRepository::new(watch_pool.clone())),
            cache: Arc::new(MessageCacheRepository::new(watch_pool)),
            factory: self.strategies.clone(),
            settings: self.config.watcher.clone(),
        });

        let publisher = EventPublisher::start(
            database,
            &self.config.publisher,
            PublisherDeps {
                accounts: Arc::new(AccountRepository::new(bus_pool.clone())),
                cache: Arc::new(MessageCacheRepository::new(bus_pool.clone())),
                bus: Arc::new(BusRepository::new(bus_pool)),
            },
        )?;

        let lease = Arc::new(PgAdvisoryLease::new(self.pool.clone(), database));
        SubscriptionManager::start(database, deps, lease, Arc::new(publisher)).await
    }
}

/// Keyed map of running managers
pub struct ManagerRegistry {
    factory: Arc<dyn ManagerFactory>,
    managers: Mutex<HashMap<String, Arc<SubscriptionManager>>>,
}

impl ManagerRegistry {
    pub fn new(factory: Arc<dyn ManagerFactory>) -> Self {
        Self {
            factory,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the manager of `database`, starting it if needed
    pub async fn get_or_start(&self, database: &str) -> Result<Arc<SubscriptionManager>> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(database) {
            return Ok(manager.clone());
        }

        let manager = Arc::new(self.factory.create(database).await?);
        managers.insert(database.to_string(), manager.clone());
        Ok(manager)
    }

    /// The manager of `database` if one is running
    pub async fn get(&self, database: &str) -> Option<Arc<SubscriptionManager>> {
        self.managers.lock().await.get(database).cloned()
    }

    pub async fn shutdown_all(&self) {
        let managers: Vec<Arc<SubscriptionManager>> =
            self.managers.lock().await.drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.shutdown().await;
        }
        info!("All subscription managers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{MemoryAnchors, MemoryBus, MemoryCache, StaticAccounts};
    use crate::strategy::SyncStrategy;
    use mailpulse_common::config::{PublisherConfig, WatcherConfig};
    use mailpulse_common::Error;
    use mailpulse_storage::models::AccountConfig;
    use mailpulse_storage::LocalLease;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoStrategies;

    impl StrategyFactory for NoStrategies {
        fn build(&self, account: &AccountConfig) -> Result<Box<dyn SyncStrategy>> {
            Err(Error::Configuration(format!("no strategy for {}", account.account_id)))
        }
    }

    #[derive(Default)]
    struct MemoryManagers {
        created: AtomicUsize,
    }

    #[async_trait]
    impl ManagerFactory for MemoryManagers {
        async fn create(&self, database: &str) -> Result<SubscriptionManager> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let accounts = Arc::new(StaticAccounts { missing: vec![] });
            let cache = Arc::new(MemoryCache::default());
            let deps = Arc::new(WatcherDeps {
                accounts: accounts.clone(),
                anchors: Arc::new(MemoryAnchors::default()),
                cache: cache.clone(),
                factory: Arc::new(NoStrategies),
                settings: WatcherConfig::default(),
            });
            let publisher = EventPublisher::start(
                database,
                &PublisherConfig::default(),
                PublisherDeps {
                    accounts,
                    cache,
                    bus: Arc::new(MemoryBus::default()),
                },
            )?;
            SubscriptionManager::start(
                database,
                deps,
                Arc::new(LocalLease::new(database)),
                Arc::new(publisher),
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_one_manager_per_database() {
        let factory = Arc::new(MemoryManagers::default());
        let registry = ManagerRegistry::new(factory.clone());

        let first = registry.get_or_start("registry_a").await.unwrap();
        let again = registry.get_or_start("registry_a").await.unwrap();
        let other = registry.get_or_start("registry_b").await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(registry.get("registry_b").await.is_some());
        assert!(first.is_leader());
        assert!(other.is_leader());

        registry.shutdown_all().await;
        assert!(registry.get("registry_a").await.is_none());
    }
}
