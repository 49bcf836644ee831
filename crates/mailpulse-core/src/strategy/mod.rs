//! Provider sync strategies
//!
//! A strategy owns the provider session for one account and turns provider
//! responses into [`ChangeEvent`]s. The watcher drives it one cycle at a time
//! and rebuilds it after every failure.

pub mod gmail;
pub mod graph;
pub mod imap;

pub use gmail::GmailStrategy;
pub use graph::GraphStrategy;
pub use imap::ImapStrategy;

use crate::providers::{GmailClient, GraphClient, ImapConnector, PushConnector};
use async_trait::async_trait;
use mailpulse_common::types::{AccountId, ChangeEvent, ProviderKind};
use mailpulse_common::{Config, Result};
use mailpulse_storage::models::AccountConfig;
use mailpulse_storage::{AnchorRepositoryTrait, MessageCacheRepositoryTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives every event a watcher produces, in order
pub type EventSink = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// How a cycle ended; decides the pause before the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Changes were emitted; poll again soon
    Changed,
    /// Nothing new
    Quiet,
    /// The session ended because the watcher was cancelled
    Closed,
}

/// Everything a strategy may touch besides its provider session
#[derive(Clone)]
pub struct WatcherContext {
    pub account_id: AccountId,
    pub cancel: CancellationToken,
    pub anchors: Arc<dyn AnchorRepositoryTrait>,
    pub cache: Arc<dyn MessageCacheRepositoryTrait>,
    sink: EventSink,
}

impl WatcherContext {
    pub fn new(
        account_id: AccountId,
        cancel: CancellationToken,
        anchors: Arc<dyn AnchorRepositoryTrait>,
        cache: Arc<dyn MessageCacheRepositoryTrait>,
        sink: EventSink,
    ) -> Self {
        Self {
            account_id,
            cancel,
            anchors,
            cache,
            sink,
        }
    }

    pub fn emit(&self, event: ChangeEvent) {
        (self.sink)(event);
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// One provider-specific change detection loop
#[async_trait]
pub trait SyncStrategy: Send {
    fn kind(&self) -> ProviderKind;

    /// Run one cycle. Push strategies stay inside a cycle until cancelled.
    async fn run_cycle(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome>;
}

/// Builds a strategy from freshly loaded account configuration
pub trait StrategyFactory: Send + Sync {
    fn build(&self, account: &AccountConfig) -> Result<Box<dyn SyncStrategy>>;
}

/// Production factory backed by the real provider clients
pub struct DefaultStrategyFactory {
    config: Arc<Config>,
    connector: Arc<dyn PushConnector>,
}

impl DefaultStrategyFactory {
    pub fn new(config: Arc<Config>) -> Self {
        let connector = Arc::new(ImapConnector::new(config.watcher.connect_timeout()));
        Self { config, connector }
    }
}

impl StrategyFactory for DefaultStrategyFactory {
    fn build(&self, account: &AccountConfig) -> Result<Box<dyn SyncStrategy>> {
        Ok(match account.kind {
            ProviderKind::Imap => Box::new(ImapStrategy::new(
                account.clone(),
                self.connector.clone(),
                &self.config.watcher,
            )),
            ProviderKind::Gmail => {
                let client = GmailClient::new(&self.config.gmail, account)?;
                Box::new(GmailStrategy::new(Box::new(client)))
            }
            ProviderKind::Outlook => {
                let client = GraphClient::new(&self.config.outlook, account)?;
                Box::new(GraphStrategy::new(
                    Box::new(client),
                    self.config.outlook.folders.clone(),
                ))
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-ins for the storage collaborators

    use super::*;
    use mailpulse_common::types::{FlagState, MessageMeta, MessageUid};
    use mailpulse_common::Error;
    use mailpulse_storage::models::{BusMessage, Credential};
    use mailpulse_storage::{AccountRepositoryTrait, BusRepositoryTrait};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Accounts that all exist except `missing`, which lack configuration
    pub struct StaticAccounts {
        pub missing: Vec<AccountId>,
    }

    #[async_trait]
    impl AccountRepositoryTrait for StaticAccounts {
        async fn exists(&self, id: AccountId) -> Result<bool> {
            Ok(!self.missing.contains(&id))
        }

        async fn load_config(&self, id: AccountId) -> Result<AccountConfig> {
            if self.missing.contains(&id) {
                return Err(Error::Configuration(format!("account {} has no host", id)));
            }
            Ok(AccountConfig {
                account_id: id,
                kind: ProviderKind::Gmail,
                host: None,
                port: 993,
                use_tls: true,
                credential: Credential::OAuth {
                    login: None,
                    refresh_token: "refresh".into(),
                },
            })
        }

        async fn provider_kinds(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, ProviderKind>> {
            Ok(ids.iter().map(|id| (*id, ProviderKind::Gmail)).collect())
        }
    }

    #[derive(Default)]
    pub struct MemoryAnchors {
        pub history: Mutex<HashMap<AccountId, String>>,
        pub history_writes: Mutex<Vec<String>>,
        pub deltas: Mutex<HashMap<AccountId, HashMap<String, String>>>,
    }

    #[async_trait]
    impl AnchorRepositoryTrait for MemoryAnchors {
        async fn get_history_id(&self, account_id: AccountId) -> Result<Option<String>> {
            Ok(self.history.lock().unwrap().get(&account_id).cloned())
        }

        async fn set_history_id(&self, account_id: AccountId, history_id: &str) -> Result<()> {
            self.history
                .lock()
                .unwrap()
                .insert(account_id, history_id.to_string());
            self.history_writes.lock().unwrap().push(history_id.to_string());
            Ok(())
        }

        async fn get_delta_tokens(&self, account_id: AccountId) -> Result<HashMap<String, String>> {
            Ok(self
                .deltas
                .lock()
                .unwrap()
                .get(&account_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn set_delta_tokens(
            &self,
            account_id: AccountId,
            tokens: &HashMap<String, String>,
        ) -> Result<()> {
            self.deltas.lock().unwrap().insert(account_id, tokens.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryCache {
        pub meta: Mutex<Vec<(AccountId, MessageMeta)>>,
        pub flags: Mutex<BTreeMap<MessageUid, FlagState>>,
        pub removed: Mutex<Vec<MessageUid>>,
        pub parents: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl MessageCacheRepositoryTrait for MemoryCache {
        async fn message_meta(
            &self,
            account_id: AccountId,
            folder: Option<&str>,
            uids: &[MessageUid],
        ) -> Result<Vec<MessageMeta>> {
            Ok(self
                .meta
                .lock()
                .unwrap()
                .iter()
                .filter(|(acc, m)| {
                    *acc == account_id
                        && uids.contains(&m.uid)
                        && folder.map_or(true, |f| m.folder.as_deref() == Some(f))
                })
                .map(|(_, m)| m.clone())
                .collect())
        }

        async fn update_flags(
            &self,
            _account_id: AccountId,
            _folder: Option<&str>,
            flags: &BTreeMap<MessageUid, FlagState>,
        ) -> Result<()> {
            let mut current = self.flags.lock().unwrap();
            for (uid, state) in flags {
                current.entry(uid.clone()).or_default().merge(*state);
            }
            Ok(())
        }

        async fn remove_uids(
            &self,
            _account_id: AccountId,
            _folder: Option<&str>,
            uids: &[MessageUid],
        ) -> Result<()> {
            self.removed.lock().unwrap().extend(uids.iter().cloned());
            Ok(())
        }

        async fn get_parent_folder(
            &self,
            _account_id: AccountId,
            message_id: &str,
        ) -> Result<Option<String>> {
            Ok(self.parents.lock().unwrap().get(message_id).cloned())
        }

        async fn set_parent_folder(
            &self,
            _account_id: AccountId,
            message_id: &str,
            folder_id: &str,
        ) -> Result<()> {
            self.parents
                .lock()
                .unwrap()
                .insert(message_id.to_string(), folder_id.to_string());
            Ok(())
        }
    }

    /// Bus that records published rows; `fail_next` rejects one batch
    #[derive(Default)]
    pub struct MemoryBus {
        pub fail_next: Mutex<bool>,
        pub published: Mutex<Vec<BusMessage>>,
    }

    impl MemoryBus {
        pub fn published(&self) -> Vec<BusMessage> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusRepositoryTrait for MemoryBus {
        async fn publish_batch(&self, messages: &[BusMessage]) -> Result<()> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(Error::PublisherWrite("connection lost".into()));
            }
            self.published.lock().unwrap().extend(messages.iter().cloned());
            Ok(())
        }
    }

    /// Context whose sink records every event
    pub struct Harness {
        pub ctx: WatcherContext,
        pub events: Arc<Mutex<Vec<ChangeEvent>>>,
        pub anchors: Arc<MemoryAnchors>,
        pub cache: Arc<MemoryCache>,
    }

    impl Harness {
        pub fn new(account_id: AccountId) -> Self {
            let events = Arc::new(Mutex::new(Vec::new()));
            let anchors = Arc::new(MemoryAnchors::default());
            let cache = Arc::new(MemoryCache::default());
            let recorded = events.clone();
            let ctx = WatcherContext::new(
                account_id,
                CancellationToken::new(),
                anchors.clone(),
                cache.clone(),
                Arc::new(move |event| recorded.lock().unwrap().push(event)),
            );
            Self {
                ctx,
                events,
                anchors,
                cache,
            }
        }

        pub fn take_events(&self) -> Vec<ChangeEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }
}
