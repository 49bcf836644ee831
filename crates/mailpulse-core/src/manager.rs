//! Subscription Manager - per-database coordinator
//!
//! Tracks which client sessions are interested in which accounts, runs one
//! watcher per watched account when this process holds the leader lease, and
//! expires sessions whose heartbeat went quiet.

use crate::metrics::metrics;
use crate::publisher::EventPublisher;
use crate::runtime::WorkerRuntime;
use crate::strategy::EventSink;
use crate::watcher::{AccountWatcher, WatcherDeps, WatcherListener};
use chrono::Utc;
use mailpulse_common::types::{AccountId, AccountMetrics, ChangeEvent, SessionId, WatcherStatusKind};
use mailpulse_common::{Error, Result};
use mailpulse_storage::LeaderLease;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest error text stored or published for a watcher
const MAX_ERROR_CHARS: usize = 200;

/// Shortest GC period
const MIN_GC_INTERVAL: Duration = Duration::from_secs(1);

/// Answer to subscribe / unsubscribe / touch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionReply {
    pub ok: bool,
    pub leader: bool,
    pub watching: bool,
    pub subs: usize,
}

/// Snapshot returned by [`SubscriptionManager::status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub is_leader: bool,
    pub database: String,
    pub active_watchers: Vec<AccountId>,
    pub subscriptions: BTreeMap<AccountId, usize>,
    pub metrics: BTreeMap<AccountId, AccountMetrics>,
    /// Events waiting in the publisher queue
    pub pending_events: usize,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<AccountId, HashMap<SessionId, Instant>>,
    watchers: HashMap<AccountId, AccountWatcher>,
    /// Released watchers still winding down
    stopping: HashMap<AccountId, JoinHandle<()>>,
    metrics: HashMap<AccountId, AccountMetrics>,
}

struct Inner {
    database: String,
    is_leader: bool,
    ttl: Duration,
    handle: Handle,
    deps: Arc<WatcherDeps>,
    publisher: Arc<EventPublisher>,
    state: Mutex<State>,
    this: Weak<Inner>,
}

/// Forwards watcher callbacks without keeping the manager alive
struct Relay(Weak<Inner>);

impl WatcherListener for Relay {
    fn cycle_failed(&self, account_id: AccountId, error: &Error) {
        if let Some(inner) = self.0.upgrade() {
            inner.record_error(account_id, error);
        }
    }
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sink(&self) -> EventSink {
        let weak = self.this.clone();
        Arc::new(move |event: ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        })
    }

    fn on_event(&self, event: ChangeEvent) {
        let account_id = event.account_id();
        {
            let mut state = self.lock();
            let entry = state.metrics.entry(account_id).or_default();
            entry.events += 1;
            entry.last_event = Some(Utc::now());
        }
        if let Some(m) = metrics() {
            m.events_emitted.with_label_values(&[event.kind().as_str()]).inc();
        }
        self.publisher.enqueue(event);
    }

    fn record_error(&self, account_id: AccountId, error: &Error) {
        let message = truncate(&error.to_string());
        {
            let mut state = self.lock();
            // Errors arriving after the watcher was released are stale
            if !state.watchers.contains_key(&account_id) {
                return;
            }
            state.metrics.entry(account_id).or_default().last_error = Some(message.clone());
        }
        self.publisher.enqueue(ChangeEvent::status(
            account_id,
            WatcherStatusKind::Error,
            Some(message),
        ));
    }

    /// Record a heartbeat and make sure the account is watched
    fn register(&self, state: &mut State, account_id: AccountId, session_id: &str, now: Instant) {
        state
            .subscriptions
            .entry(account_id)
            .or_default()
            .insert(session_id.to_string(), now);
        self.ensure_watcher(state, account_id);
    }

    fn ensure_watcher(&self, state: &mut State, account_id: AccountId) {
        if !self.is_leader || state.watchers.contains_key(&account_id) {
            return;
        }

        // A released watcher may still be inside a sync; the new one starts after it
        let predecessor = state.stopping.remove(&account_id);
        let watcher = AccountWatcher::start(
            account_id,
            self.deps.clone(),
            self.sink(),
            Arc::new(Relay(self.this.clone())),
            &self.handle,
            predecessor,
        );
        state.watchers.insert(account_id, watcher);
        state.metrics.insert(account_id, AccountMetrics::default());
        if let Some(m) = metrics() {
            m.active_watchers.inc();
        }
        self.publisher
            .enqueue(ChangeEvent::status(account_id, WatcherStatusKind::Started, None));
    }

    /// Forget the account and stop its watcher in the background
    fn release(&self, state: &mut State, account_id: AccountId) {
        state.subscriptions.remove(&account_id);
        state.metrics.remove(&account_id);
        state.stopping.retain(|_, task| !task.is_finished());

        let Some(watcher) = state.watchers.remove(&account_id) else {
            return;
        };
        watcher.cancel();
        let stopping = self.handle.spawn(watcher.stop());
        state.stopping.insert(account_id, stopping);
        if let Some(m) = metrics() {
            m.active_watchers.dec();
        }
        self.publisher
            .enqueue(ChangeEvent::status(account_id, WatcherStatusKind::Stopped, None));
    }

    fn reply(&self, state: &State, account_id: AccountId) -> SubscriptionReply {
        SubscriptionReply {
            ok: true,
            leader: self.is_leader,
            watching: state.watchers.contains_key(&account_id),
            subs: state.subscriptions.get(&account_id).map_or(0, HashMap::len),
        }
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let mut expired = 0;
        let mut emptied = Vec::new();

        for (account_id, sessions) in state.subscriptions.iter_mut() {
            let before = sessions.len();
            sessions.retain(|_, seen| now.saturating_duration_since(*seen) <= self.ttl);
            expired += before - sessions.len();
            if sessions.is_empty() {
                emptied.push(*account_id);
            }
        }

        for account_id in emptied {
            info!(database = %self.database, account_id, "Last subscriber expired, releasing account");
            self.release(&mut state, account_id);
        }
        expired
    }
}

struct GcWorker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Heartbeat GC loop, hosted next to the watchers
async fn run_gc(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(MIN_GC_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let expired = inner.sweep(Instant::now());
        if expired > 0 {
            debug!(database = %inner.database, expired, "Expired idle subscriptions");
        }
    }
}

/// Coordinator for one database
pub struct SubscriptionManager {
    inner: Arc<Inner>,
    lease: Arc<dyn LeaderLease>,
    gc: Mutex<Option<GcWorker>>,
    worker: Mutex<Option<WorkerRuntime>>,
}

impl SubscriptionManager {
    /// Try to take the leader lease, start the watcher loop and the GC worker
    pub async fn start(
        database: impl Into<String>,
        deps: Arc<WatcherDeps>,
        lease: Arc<dyn LeaderLease>,
        publisher: Arc<EventPublisher>,
    ) -> Result<Self> {
        let database = database.into();

        let is_leader = match lease.acquire().await {
            Ok(held) => held,
            Err(e) => {
                error!(database = %database, "Leader election failed, running as follower: {}", e);
                false
            }
        };

        let worker = WorkerRuntime::spawn(format!("mailpulse-watch-{}", database))?;
        let ttl = deps.settings.heartbeat_ttl();
        let gc_interval = deps.settings.gc_interval();

        let inner = Arc::new_cyclic(|this| Inner {
            database: database.clone(),
            is_leader,
            ttl,
            handle: worker.handle().clone(),
            deps,
            publisher,
            state: Mutex::new(State::default()),
            this: this.clone(),
        });

        let gc_cancel = CancellationToken::new();
        let gc = GcWorker {
            task: worker.spawn_task(run_gc(Arc::downgrade(&inner), gc_interval, gc_cancel.clone())),
            cancel: gc_cancel,
        };
        info!(database = %database, is_leader, "Subscription manager started");

        Ok(Self {
            inner,
            lease,
            gc: Mutex::new(Some(gc)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader
    }

    /// Register interest of a session in an account. Idempotent.
    pub fn subscribe(&self, account_id: AccountId, session_id: &str) -> SubscriptionReply {
        let mut state = self.inner.lock();
        self.inner.register(&mut state, account_id, session_id, Instant::now());
        debug!(account_id, session_id, "Subscribed");
        self.inner.reply(&state, account_id)
    }

    pub fn unsubscribe(&self, account_id: AccountId, session_id: &str) -> SubscriptionReply {
        let mut state = self.inner.lock();
        let emptied = match state.subscriptions.get_mut(&account_id) {
            Some(sessions) => {
                sessions.remove(session_id);
                sessions.is_empty()
            }
            None => false,
        };
        if emptied {
            self.inner.release(&mut state, account_id);
        }
        debug!(account_id, session_id, "Unsubscribed");
        self.inner.reply(&state, account_id)
    }

    /// Heartbeat. An unknown session is subscribed on the spot.
    pub fn touch(&self, account_id: AccountId, session_id: &str) -> SubscriptionReply {
        let mut state = self.inner.lock();
        let now = Instant::now();
        let seen = state
            .subscriptions
            .get_mut(&account_id)
            .and_then(|sessions| sessions.get_mut(session_id));
        if let Some(seen) = seen {
            *seen = now;
            self.inner.ensure_watcher(&mut state, account_id);
        } else {
            debug!(account_id, session_id, "Touch from unknown session, subscribing");
            self.inner.register(&mut state, account_id, session_id, now);
        }
        self.inner.reply(&state, account_id)
    }

    pub fn status(&self) -> ManagerStatus {
        let state = self.inner.lock();

        let mut active_watchers: Vec<AccountId> = state.watchers.keys().copied().collect();
        active_watchers.sort_unstable();

        let subscriptions = state
            .subscriptions
            .iter()
            .map(|(id, sessions)| (*id, sessions.len()))
            .collect();

        let metrics = state
            .metrics
            .iter()
            .map(|(id, m)| {
                let mut m = m.clone();
                m.phase = state.watchers.get(id).map(|w| w.phase().as_str().to_string());
                (*id, m)
            })
            .collect();

        ManagerStatus {
            is_leader: self.inner.is_leader,
            database: self.inner.database.clone(),
            active_watchers,
            subscriptions,
            metrics,
            pending_events: self.inner.publisher.queue_len(),
        }
    }

    /// Drop sessions whose last heartbeat is older than the TTL at `now`.
    /// Returns how many sessions expired.
    pub fn gc_sweep(&self, now: Instant) -> usize {
        self.inner.sweep(now)
    }

    /// Stop GC and every watcher, flush the publisher and give up the lease
    pub async fn shutdown(&self) {
        let database = self.inner.database.clone();

        let gc = self.gc.lock().ok().and_then(|mut gc| gc.take());
        if let Some(gc) = gc {
            gc.cancel.cancel();
            if let Err(e) = gc.task.await {
                warn!(database = %database, "GC worker did not shut down cleanly: {}", e);
            }
        }

        let (watchers, released): (Vec<AccountWatcher>, Vec<JoinHandle<()>>) = {
            let mut state = self.inner.lock();
            state.subscriptions.clear();
            state.metrics.clear();
            (
                state.watchers.drain().map(|(_, w)| w).collect(),
                state.stopping.drain().map(|(_, task)| task).collect(),
            )
        };

        let mut stopping = JoinSet::new();
        for task in released {
            stopping.spawn(async move {
                let _ = task.await;
            });
        }
        for watcher in watchers {
            let account_id = watcher.account_id();
            self.inner
                .publisher
                .enqueue(ChangeEvent::status(account_id, WatcherStatusKind::Stopped, None));
            if let Some(m) = metrics() {
                m.active_watchers.dec();
            }
            stopping.spawn(watcher.stop());
        }
        while stopping.join_next().await.is_some() {}

        self.inner.publisher.shutdown().await;

        if let Err(e) = self.lease.release().await {
            warn!(database = %database, "Failed to release leader lease: {}", e);
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(mut worker) = worker {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
                warn!(database = %database, "Watcher runtime shutdown failed: {}", e);
            }
        }
        info!(database = %database, "Subscription manager stopped");
    }
}
