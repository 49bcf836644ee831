//! Event publisher
//!
//! Watchers hand events to a bounded in-memory queue and never wait on the
//! database. A dedicated worker drains the queue in short windows, coalesces
//! the batch, enriches it and writes it to the bus in one transaction.

use crate::metrics::metrics;
use crate::runtime::WorkerRuntime;
use mailpulse_common::config::PublisherConfig;
use mailpulse_common::types::{account_channel, AccountId, ChangeEvent, EventKind, ProviderKind};
use mailpulse_common::Result;
use mailpulse_storage::models::BusMessage;
use mailpulse_storage::{AccountRepositoryTrait, BusRepositoryTrait, MessageCacheRepositoryTrait};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hint carried by refreshes that replaced queued events
pub const BACKPRESSURE_HINT: &str = "backpressure";

/// A queued event and the bus channel it goes to
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub event: ChangeEvent,
}

/// Default bus channel of an account
pub fn default_channel(database: &str, account_id: AccountId) -> String {
    format!("{}, {}", database, account_channel(account_id))
}

/// Bounded multi-producer queue that degrades instead of blocking
pub struct PublishQueue {
    items: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an envelope. When full, the oldest event of the same account
    /// is replaced by a refresh and the new event is dropped. Returns whether
    /// the queue had to degrade.
    pub fn push(&self, envelope: Envelope) -> bool {
        let degraded = {
            let mut items = self.lock();
            if items.len() < self.capacity {
                items.push_back(envelope);
                false
            } else {
                degrade(&mut items, envelope);
                true
            }
        };
        self.notify.notify_one();
        degraded
    }

    /// Take up to `max` envelopes from the front
    pub fn drain(&self, max: usize) -> Vec<Envelope> {
        let mut items = self.lock();
        let n = items.len().min(max);
        items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once something was pushed since the last wake-up
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

fn degrade(items: &mut VecDeque<Envelope>, incoming: Envelope) {
    let account_id = incoming.event.account_id();
    let refresh = ChangeEvent::refresh(account_id, BACKPRESSURE_HINT);

    let oldest = items.iter().position(|queued| {
        queued.event.account_id() == account_id && queued.event.kind() != EventKind::Refresh
    });
    match oldest {
        Some(index) => {
            items[index].event = refresh;
        }
        None => {
            let already_degraded = items
                .iter()
                .any(|queued| queued.event.account_id() == account_id);
            if !already_degraded {
                items.pop_front();
                items.push_back(Envelope {
                    channel: incoming.channel,
                    event: refresh,
                });
            }
        }
    }
}

/// Coalescing key: channel, kind, account, folder
type Key = (String, EventKind, AccountId, Option<String>);

/// Merge events that share a key.
///
/// `flags` and `removed` keep the latest event, `added` events are merged
/// with their UIDs deduplicated in first-seen order. Every merged key stays
/// at the position of its first occurrence; other kinds pass through.
pub fn coalesce(batch: Vec<Envelope>) -> Vec<Envelope> {
    let mut out: Vec<Envelope> = Vec::with_capacity(batch.len());
    let mut slots: HashMap<Key, usize> = HashMap::new();

    for envelope in batch {
        let kind = envelope.event.kind();
        if !matches!(kind, EventKind::Added | EventKind::Removed | EventKind::Flags) {
            out.push(envelope);
            continue;
        }

        let key = (
            envelope.channel.clone(),
            kind,
            envelope.event.account_id(),
            envelope.event.folder().map(str::to_string),
        );
        let Some(&slot) = slots.get(&key) else {
            slots.insert(key, out.len());
            out.push(envelope);
            continue;
        };

        let current = &mut out[slot].event;
        match (current, envelope.event) {
            (
                ChangeEvent::Added { uids, metadata, .. },
                ChangeEvent::Added {
                    uids: more_uids,
                    metadata: more_metadata,
                    ..
                },
            ) => {
                for uid in more_uids {
                    if !uids.contains(&uid) {
                        uids.push(uid);
                    }
                }
                for meta in more_metadata {
                    if !metadata.iter().any(|m| m.uid == meta.uid) {
                        metadata.push(meta);
                    }
                }
            }
            (current, latest) => *current = latest,
        }
    }

    out
}

/// Storage collaborators of the publisher
#[derive(Clone)]
pub struct PublisherDeps {
    pub accounts: Arc<dyn AccountRepositoryTrait>,
    pub cache: Arc<dyn MessageCacheRepositoryTrait>,
    pub bus: Arc<dyn BusRepositoryTrait>,
}

/// Attach cached metadata to bare IMAP `added` events
async fn enrich(deps: &PublisherDeps, kind: ProviderKind, event: ChangeEvent) -> ChangeEvent {
    match event {
        ChangeEvent::Added {
            account_id,
            folder,
            uids,
            metadata,
        } if !kind.is_vendor() && metadata.is_empty() && !uids.is_empty() => {
            let metadata = match deps.cache.message_meta(account_id, folder.as_deref(), &uids).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(account_id, "Metadata enrichment failed: {}", e);
                    Vec::new()
                }
            };
            ChangeEvent::Added {
                account_id,
                folder,
                uids,
                metadata,
            }
        }
        other => other,
    }
}

/// Coalesce, enrich and write one batch. Returns the number of bus messages
/// written. Failures are logged; the batch is then lost.
pub async fn flush_batch(deps: &PublisherDeps, batch: Vec<Envelope>) -> usize {
    let batch = coalesce(batch);
    if batch.is_empty() {
        return 0;
    }

    let mut account_ids: Vec<AccountId> = batch.iter().map(|e| e.event.account_id()).collect();
    account_ids.sort_unstable();
    account_ids.dedup();

    let kinds = match deps.accounts.provider_kinds(&account_ids).await {
        Ok(kinds) => kinds,
        Err(e) => {
            error!("Bus publish failed, resolving accounts: {}", e);
            if let Some(m) = metrics() {
                m.publish_failures.inc();
            }
            return 0;
        }
    };

    let mut messages = Vec::with_capacity(batch.len());
    for envelope in batch {
        let account_id = envelope.event.account_id();
        let Some(kind) = kinds.get(&account_id).copied() else {
            debug!(account_id, "Skipping event for missing account");
            continue;
        };

        let event = enrich(deps, kind, envelope.event).await;
        let mut payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(account_id, "Dropping unserialisable event: {}", e);
                continue;
            }
        };
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("provider".to_string(), kind.as_str().into());
        }
        messages.push(BusMessage {
            channel: envelope.channel,
            payload,
        });
    }

    if messages.is_empty() {
        return 0;
    }

    match deps.bus.publish_batch(&messages).await {
        Ok(()) => {
            debug!(count = messages.len(), "Bus batch published");
            if let Some(m) = metrics() {
                m.events_published.inc_by(messages.len() as u64);
            }
            messages.len()
        }
        Err(e) => {
            error!(count = messages.len(), "Bus publish failed: {}", e);
            if let Some(m) = metrics() {
                m.publish_failures.inc();
            }
            0
        }
    }
}

async fn run(
    queue: Arc<PublishQueue>,
    deps: PublisherDeps,
    window: Duration,
    max_batch: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = queue.notified() => {}
        }

        // Let the window fill before draining
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(window) => {}
        }

        while !queue.is_empty() {
            flush_batch(&deps, queue.drain(max_batch)).await;
        }
    }

    while !queue.is_empty() {
        flush_batch(&deps, queue.drain(max_batch)).await;
    }
    debug!("Publisher loop exited");
}

/// Background publisher for one database
pub struct EventPublisher {
    database: String,
    queue: Arc<PublishQueue>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<WorkerRuntime>>,
}

impl EventPublisher {
    /// Start the publisher on its own worker thread
    pub fn start(database: impl Into<String>, config: &PublisherConfig, deps: PublisherDeps) -> Result<Self> {
        let database = database.into();
        let worker = WorkerRuntime::spawn(format!("mailpulse-bus-{}", database))?;
        let queue = Arc::new(PublishQueue::new(config.queue_capacity));
        let cancel = CancellationToken::new();

        let task = worker.spawn_task(run(
            queue.clone(),
            deps,
            config.batch_window(),
            config.max_batch.max(1),
            cancel.clone(),
        ));
        info!(database = %database, capacity = config.queue_capacity, "Event publisher started");

        Ok(Self {
            database,
            queue,
            cancel,
            task: Mutex::new(Some(task)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue an event on its account's default channel
    pub fn enqueue(&self, event: ChangeEvent) {
        let channel = default_channel(&self.database, event.account_id());
        self.enqueue_on(channel, event);
    }

    /// Queue an event on an explicit channel
    pub fn enqueue_on(&self, channel: String, event: ChangeEvent) {
        let account_id = event.account_id();
        if self.queue.push(Envelope { channel, event }) {
            warn!(account_id, "Publish queue full, degraded to refresh");
            if let Some(m) = metrics() {
                m.events_degraded.inc();
            }
        }
    }

    /// Events waiting for the next flush
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Flush what is queued and stop the worker
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Publisher task ended abnormally: {}", e);
            }
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(mut worker) = worker {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
                warn!("Publisher worker shutdown failed: {}", e);
            }
        }
        info!(database = %self.database, "Event publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{MemoryBus, MemoryCache};
    use async_trait::async_trait;
    use mailpulse_common::types::{FlagState, MessageMeta};
    use mailpulse_common::Error;
    use mailpulse_storage::models::AccountConfig;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    struct KindAccounts(HashMap<AccountId, ProviderKind>);

    #[async_trait]
    impl AccountRepositoryTrait for KindAccounts {
        async fn exists(&self, id: AccountId) -> Result<bool> {
            Ok(self.0.contains_key(&id))
        }

        async fn load_config(&self, id: AccountId) -> Result<AccountConfig> {
            Err(Error::NotFound(format!("mail account {}", id)))
        }

        async fn provider_kinds(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, ProviderKind>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.0.get(id).map(|k| (*id, *k)))
                .collect())
        }
    }

    fn envelope(event: ChangeEvent) -> Envelope {
        Envelope {
            channel: default_channel("crm", event.account_id()),
            event,
        }
    }

    fn added(account_id: AccountId, uids: &[&str]) -> ChangeEvent {
        ChangeEvent::Added {
            account_id,
            folder: Some("INBOX".into()),
            uids: uids.iter().map(|u| u.to_string()).collect(),
            metadata: vec![],
        }
    }

    fn flags(account_id: AccountId, uid: &str, seen: bool) -> ChangeEvent {
        ChangeEvent::FlagsChanged {
            account_id,
            folder: Some("INBOX".into()),
            flags_by_uid: BTreeMap::from([(uid.to_string(), FlagState::new(seen, false))]),
        }
    }

    fn deps(kinds: &[(AccountId, ProviderKind)]) -> (PublisherDeps, Arc<MemoryBus>, Arc<MemoryCache>) {
        let bus = Arc::new(MemoryBus::default());
        let cache = Arc::new(MemoryCache::default());
        let deps = PublisherDeps {
            accounts: Arc::new(KindAccounts(kinds.iter().copied().collect())),
            cache: cache.clone(),
            bus: bus.clone(),
        };
        (deps, bus, cache)
    }

    #[test]
    fn test_default_channel() {
        assert_eq!(default_channel("crm", 42), "crm, account.42");
    }

    #[test]
    fn test_coalesce_flags_last_wins_and_added_merges() {
        let batch = vec![
            envelope(added(1, &["10"])),
            envelope(flags(1, "10", false)),
            envelope(ChangeEvent::refresh(1, "expunge")),
            envelope(added(1, &["11", "10"])),
            envelope(flags(1, "10", true)),
            envelope(added(1, &["12"])),
        ];

        let out: Vec<ChangeEvent> = coalesce(batch).into_iter().map(|e| e.event).collect();

        assert_eq!(
            out,
            vec![
                added(1, &["10", "11", "12"]),
                flags(1, "10", true),
                ChangeEvent::refresh(1, "expunge"),
            ]
        );
    }

    #[test]
    fn test_coalesce_keeps_distinct_keys_apart() {
        let other_folder = ChangeEvent::Removed {
            account_id: 1,
            folder: Some("Sent".into()),
            uids: vec!["5".into()],
        };
        let inbox = ChangeEvent::Removed {
            account_id: 1,
            folder: Some("INBOX".into()),
            uids: vec!["6".into()],
        };
        let other_account = ChangeEvent::Removed {
            account_id: 2,
            folder: Some("INBOX".into()),
            uids: vec!["6".into()],
        };
        let batch = vec![
            envelope(other_folder.clone()),
            envelope(inbox.clone()),
            envelope(other_account.clone()),
        ];

        let out: Vec<ChangeEvent> = coalesce(batch).into_iter().map(|e| e.event).collect();
        assert_eq!(out, vec![other_folder, inbox, other_account]);
    }

    #[test]
    fn test_full_queue_degrades_instead_of_blocking() {
        let queue = PublishQueue::new(2000);
        let mut degraded = 0;
        for i in 0..3000 {
            let account_id = (i % 3) as AccountId;
            if queue.push(envelope(added(account_id, &[&i.to_string()]))) {
                degraded += 1;
            }
        }

        assert_eq!(degraded, 1000);
        assert_eq!(queue.len(), 2000);

        let drained = queue.drain(usize::MAX);
        let refreshes: Vec<&Envelope> = drained
            .iter()
            .filter(|e| e.event == ChangeEvent::refresh(e.event.account_id(), BACKPRESSURE_HINT))
            .collect();
        assert_eq!(refreshes.len(), 1000);
        // The earliest events were the ones replaced
        assert_eq!(drained[0].event, ChangeEvent::refresh(0, BACKPRESSURE_HINT));
        assert_eq!(drained[1999].event, added(1, &["1999"]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_for_new_account_drops_oldest() {
        let queue = PublishQueue::new(2);
        queue.push(envelope(added(1, &["1"])));
        queue.push(envelope(added(1, &["2"])));

        assert!(queue.push(envelope(added(2, &["3"]))));
        // a second overflow for account 2 finds its refresh already queued
        assert!(queue.push(envelope(added(2, &["4"]))));

        let events: Vec<ChangeEvent> = queue.drain(10).into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![added(1, &["2"]), ChangeEvent::refresh(2, BACKPRESSURE_HINT)]
        );
    }

    #[tokio::test]
    async fn test_flush_tags_provider_enriches_and_skips_missing_accounts() {
        let (deps, bus, cache) = deps(&[(1, ProviderKind::Imap), (2, ProviderKind::Gmail)]);
        cache.meta.lock().unwrap().push((
            1,
            MessageMeta {
                uid: "10".into(),
                folder: Some("INBOX".into()),
                subject: Some("Quarterly report".into()),
                ..Default::default()
            },
        ));

        let written = flush_batch(
            &deps,
            vec![
                envelope(added(1, &["10"])),
                envelope(ChangeEvent::refresh(2, "resync")),
                envelope(ChangeEvent::refresh(3, "resync")),
            ],
        )
        .await;

        assert_eq!(written, 2);
        let published = bus.published();
        assert_eq!(published[0].channel, "crm, account.1");
        assert_eq!(published[0].payload["type"], "added");
        assert_eq!(published[0].payload["provider"], "imap");
        assert_eq!(published[0].payload["metadata"][0]["subject"], "Quarterly report");
        assert_eq!(published[1].channel, "crm, account.2");
        assert_eq!(published[1].payload["provider"], "gmail");
        assert_eq!(published[1].payload["hint"], "resync");
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_later_batches() {
        let (deps, bus, _) = deps(&[(1, ProviderKind::Outlook)]);
        *bus.fail_next.lock().unwrap() = true;

        assert_eq!(flush_batch(&deps, vec![envelope(ChangeEvent::refresh(1, "a"))]).await, 0);
        assert_eq!(flush_batch(&deps, vec![envelope(ChangeEvent::refresh(1, "b"))]).await, 1);
        assert_eq!(bus.published()[0].payload["hint"], "b");
    }

    #[tokio::test]
    async fn test_publisher_flushes_on_shutdown() {
        let (deps, bus, _) = deps(&[(1, ProviderKind::Gmail)]);
        let publisher = EventPublisher::start("crm", &PublisherConfig::default(), deps).unwrap();

        publisher.enqueue(added(1, &["a"]));
        publisher.enqueue(added(1, &["b"]));
        publisher.enqueue(flags(1, "a", true));
        publisher.shutdown().await;

        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].payload["uids"], serde_json::json!(["a", "b"]));
        assert_eq!(published[1].payload["type"], "flags");
    }
}
