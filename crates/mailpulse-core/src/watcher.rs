//! Account watcher - supervised sync loop for one account

use crate::backoff::{jitter, Backoff};
use crate::metrics::metrics;
use crate::strategy::{CycleOutcome, EventSink, StrategyFactory, SyncStrategy, WatcherContext};
use mailpulse_common::config::WatcherConfig;
use mailpulse_common::types::AccountId;
use mailpulse_common::{Error, Result};
use mailpulse_storage::{AccountRepositoryTrait, AnchorRepositoryTrait, MessageCacheRepositoryTrait};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    Idle,
    Connecting,
    Syncing,
    BackoffWait,
    Stopping,
    Stopped,
}

impl WatcherPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherPhase::Idle => "idle",
            WatcherPhase::Connecting => "connecting",
            WatcherPhase::Syncing => "syncing",
            WatcherPhase::BackoffWait => "backoff_wait",
            WatcherPhase::Stopping => "stopping",
            WatcherPhase::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WatcherPhase::Idle,
            1 => WatcherPhase::Connecting,
            2 => WatcherPhase::Syncing,
            3 => WatcherPhase::BackoffWait,
            4 => WatcherPhase::Stopping,
            _ => WatcherPhase::Stopped,
        }
    }
}

#[derive(Debug)]
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new(phase: WatcherPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    fn set(&self, phase: WatcherPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> WatcherPhase {
        WatcherPhase::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Receives failed cycles so they can be surfaced to operators and clients
pub trait WatcherListener: Send + Sync {
    fn cycle_failed(&self, account_id: AccountId, error: &Error);
}

/// Collaborators shared by every watcher of a manager
pub struct WatcherDeps {
    pub accounts: Arc<dyn AccountRepositoryTrait>,
    pub anchors: Arc<dyn AnchorRepositoryTrait>,
    pub cache: Arc<dyn MessageCacheRepositoryTrait>,
    pub factory: Arc<dyn StrategyFactory>,
    pub settings: WatcherConfig,
}

/// Handle to a running account watcher
pub struct AccountWatcher {
    account_id: AccountId,
    cancel: CancellationToken,
    phase: Arc<PhaseCell>,
    grace: Duration,
    task: Option<JoinHandle<()>>,
}

impl AccountWatcher {
    /// Spawn the supervised loop on `handle`. When `predecessor` is given the
    /// loop only begins once that earlier watcher of the account has stopped.
    pub fn start(
        account_id: AccountId,
        deps: Arc<WatcherDeps>,
        sink: EventSink,
        listener: Arc<dyn WatcherListener>,
        handle: &Handle,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let phase = Arc::new(PhaseCell::new(WatcherPhase::Idle));
        let ctx = WatcherContext::new(
            account_id,
            cancel.clone(),
            deps.anchors.clone(),
            deps.cache.clone(),
            sink,
        );
        let grace = deps.settings.stop_grace();
        let task_phase = phase.clone();

        let task = handle.spawn(async move {
            if let Some(previous) = predecessor {
                debug!(account_id, "Waiting for previous watcher to stop");
                let _ = previous.await;
            }
            run(ctx, deps, listener, task_phase).await;
        });
        info!(account_id, "Watcher started");

        Self {
            account_id,
            cancel,
            phase,
            grace,
            task: Some(task),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn phase(&self) -> WatcherPhase {
        self.phase.get()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal the loop to wind down without waiting for it
    pub fn cancel(&self) {
        self.phase.set(WatcherPhase::Stopping);
        self.cancel.cancel();
    }

    /// Cancel the loop and wait up to the grace period for protocol teardown,
    /// then abort whatever is left.
    pub async fn stop(mut self) {
        let account_id = self.account_id;
        self.phase.set(WatcherPhase::Stopping);
        self.cancel.cancel();

        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(self.grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(account_id, "Watcher task ended abnormally: {}", e),
            Err(_) => {
                warn!(account_id, grace = ?self.grace, "Watcher did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        self.phase.set(WatcherPhase::Stopped);
        info!(account_id, "Watcher stopped");
    }
}

impl Drop for AccountWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fresh configuration and a fresh provider session for every attempt
async fn build_strategy(deps: &WatcherDeps, account_id: AccountId) -> Result<Box<dyn SyncStrategy>> {
    let account = deps.accounts.load_config(account_id).await?;
    deps.factory.build(&account)
}

async fn run(
    ctx: WatcherContext,
    deps: Arc<WatcherDeps>,
    listener: Arc<dyn WatcherListener>,
    phase: Arc<PhaseCell>,
) {
    let account_id = ctx.account_id;
    let settings = &deps.settings;
    let mut backoff = Backoff::new(
        Duration::from_secs(settings.backoff_base_secs),
        Duration::from_secs(settings.backoff_cap_secs),
    );
    let max_jitter = Duration::from_millis(settings.jitter_ms);
    let mut strategy: Option<Box<dyn SyncStrategy>> = None;

    while !ctx.cancel.is_cancelled() {
        let result = match strategy.as_mut() {
            Some(active) => {
                phase.set(WatcherPhase::Syncing);
                active.run_cycle(&ctx).await
            }
            None => {
                phase.set(WatcherPhase::Connecting);
                match build_strategy(&deps, account_id).await {
                    Ok(built) => {
                        debug!(account_id, provider = %built.kind(), "Strategy ready");
                        strategy = Some(built);
                        continue;
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let pause = match result {
            Ok(CycleOutcome::Closed) => {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                // Session ended on its own; reconnect after a short pause
                strategy = None;
                backoff.reset();
                settings.active_interval()
            }
            Ok(CycleOutcome::Changed) => {
                backoff.reset();
                settings.active_interval()
            }
            Ok(CycleOutcome::Quiet) => {
                backoff.reset();
                settings.quiet_interval()
            }
            Err(e) => {
                strategy = None;
                if let Some(m) = metrics() {
                    m.watcher_errors.with_label_values(&[e.code()]).inc();
                }
                listener.cycle_failed(account_id, &e);
                let delay = backoff.next_delay() + jitter(max_jitter);
                if e.is_retryable() {
                    warn!(
                        account_id,
                        failures = backoff.failures(),
                        retry_in = ?delay,
                        "Watcher cycle failed: {}",
                        e
                    );
                } else {
                    // Not the provider's fault; retried all the same
                    error!(
                        account_id,
                        failures = backoff.failures(),
                        retry_in = ?delay,
                        code = e.code(),
                        "Watcher cycle hit an internal error: {}",
                        e
                    );
                }
                phase.set(WatcherPhase::BackoffWait);
                if !ctx.pause(delay).await {
                    break;
                }
                continue;
            }
        };

        phase.set(WatcherPhase::Idle);
        if !ctx.pause(pause).await {
            break;
        }
    }

    phase.set(WatcherPhase::Stopped);
    debug!(account_id, "Watcher loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{MemoryAnchors, MemoryCache, StaticAccounts};
    use async_trait::async_trait;
    use mailpulse_common::types::{ChangeEvent, ProviderKind};
    use mailpulse_storage::models::AccountConfig;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Plays back a shared script of cycle results
    struct ScriptedStrategy {
        script: Arc<Mutex<VecDeque<Result<CycleOutcome>>>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl SyncStrategy for ScriptedStrategy {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        async fn run_cycle(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome> {
            self.calls.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => {
                    if let Ok(CycleOutcome::Changed) = result {
                        ctx.emit(ChangeEvent::refresh(ctx.account_id, "scripted"));
                    }
                    result
                }
                None => {
                    ctx.cancel.cancelled().await;
                    Ok(CycleOutcome::Closed)
                }
            }
        }
    }

    struct ScriptedFactory {
        script: Arc<Mutex<VecDeque<Result<CycleOutcome>>>>,
        calls: Arc<Mutex<Vec<Instant>>>,
        builds: Arc<Mutex<u32>>,
    }

    impl StrategyFactory for ScriptedFactory {
        fn build(&self, _account: &AccountConfig) -> Result<Box<dyn SyncStrategy>> {
            *self.builds.lock().unwrap() += 1;
            Ok(Box::new(ScriptedStrategy {
                script: self.script.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        errors: Mutex<Vec<String>>,
    }

    impl WatcherListener for RecordingListener {
        fn cycle_failed(&self, _account_id: AccountId, error: &Error) {
            self.errors.lock().unwrap().push(error.code().to_string());
        }
    }

    struct Fixture {
        deps: Arc<WatcherDeps>,
        calls: Arc<Mutex<Vec<Instant>>>,
        builds: Arc<Mutex<u32>>,
        listener: Arc<RecordingListener>,
        events: Arc<Mutex<Vec<ChangeEvent>>>,
    }

    impl Fixture {
        fn new(script: Vec<Result<CycleOutcome>>, missing: Vec<AccountId>) -> Self {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let builds = Arc::new(Mutex::new(0));
            let factory = ScriptedFactory {
                script: Arc::new(Mutex::new(VecDeque::from(script))),
                calls: calls.clone(),
                builds: builds.clone(),
            };
            let settings = WatcherConfig {
                jitter_ms: 0,
                ..Default::default()
            };
            Self {
                deps: Arc::new(WatcherDeps {
                    accounts: Arc::new(StaticAccounts { missing }),
                    anchors: Arc::new(MemoryAnchors::default()),
                    cache: Arc::new(MemoryCache::default()),
                    factory: Arc::new(factory),
                    settings,
                }),
                calls,
                builds,
                listener: Arc::new(RecordingListener::default()),
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn start(&self, account_id: AccountId) -> AccountWatcher {
            self.start_after(account_id, None)
        }

        fn start_after(&self, account_id: AccountId, predecessor: Option<JoinHandle<()>>) -> AccountWatcher {
            let events = self.events.clone();
            AccountWatcher::start(
                account_id,
                self.deps.clone(),
                Arc::new(move |event| events.lock().unwrap().push(event)),
                self.listener.clone(),
                &Handle::current(),
                predecessor,
            )
        }
    }

    fn transient() -> Result<CycleOutcome> {
        Err(Error::TransientProtocol("connection reset".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_exponentially_and_reset() {
        let fixture = Fixture::new(
            vec![
                transient(),
                transient(),
                transient(),
                Ok(CycleOutcome::Quiet),
                transient(),
            ],
            vec![],
        );
        let watcher = fixture.start(1);

        tokio::time::sleep(Duration::from_secs(120)).await;

        let calls = fixture.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 6);
        let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        // 2s, 4s, 8s after failures; quiet interval after success; 2s again after reset
        assert_eq!(gaps, vec![2, 4, 8, 30, 2]);
        assert_eq!(*fixture.builds.lock().unwrap(), 5);
        assert_eq!(fixture.listener.errors.lock().unwrap().len(), 4);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_cycles_poll_at_active_interval() {
        let fixture = Fixture::new(
            vec![Ok(CycleOutcome::Changed), Ok(CycleOutcome::Changed)],
            vec![],
        );
        let watcher = fixture.start(2);

        tokio::time::sleep(Duration::from_secs(11)).await;

        let calls = fixture.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!((calls[1] - calls[0]).as_secs(), 5);
        assert_eq!(*fixture.builds.lock().unwrap(), 1);
        assert_eq!(fixture.events.lock().unwrap().len(), 2);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_are_retried() {
        let fixture = Fixture::new(vec![], vec![3]);
        let watcher = fixture.start(3);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(*fixture.builds.lock().unwrap(), 0);
        assert_eq!(
            fixture.listener.errors.lock().unwrap()[..2],
            ["account_configuration".to_string(), "account_configuration".to_string()]
        );
        assert_eq!(watcher.phase(), WatcherPhase::BackoffWait);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_errors_are_retried_too() {
        let fixture = Fixture::new(
            vec![Err(Error::Database("pool closed".into())), Ok(CycleOutcome::Changed)],
            vec![],
        );
        let watcher = fixture.start(7);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*fixture.builds.lock().unwrap(), 2);
        assert_eq!(*fixture.listener.errors.lock().unwrap(), vec!["database_error".to_string()]);
        assert_eq!(fixture.events.lock().unwrap().len(), 1);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_graceful_exit() {
        let fixture = Fixture::new(vec![], vec![]);
        let watcher = fixture.start(4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(watcher.is_running());
        assert_eq!(watcher.phase(), WatcherPhase::Syncing);

        let phase = watcher.phase.clone();
        let started = Instant::now();
        watcher.stop().await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(phase.get(), WatcherPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successor_waits_for_previous_watcher() {
        let fixture = Fixture::new(vec![], vec![]);
        let previous = tokio::spawn(tokio::time::sleep(Duration::from_secs(2)));
        let watcher = fixture.start_after(6, Some(previous));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*fixture.builds.lock().unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fixture.builds.lock().unwrap(), 1);

        watcher.stop().await;
    }

    struct StuckStrategy;

    #[async_trait]
    impl SyncStrategy for StuckStrategy {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Imap
        }

        async fn run_cycle(&mut self, _ctx: &WatcherContext) -> Result<CycleOutcome> {
            std::future::pending::<()>().await;
            Ok(CycleOutcome::Closed)
        }
    }

    struct StuckFactory;

    impl StrategyFactory for StuckFactory {
        fn build(&self, _account: &AccountConfig) -> Result<Box<dyn SyncStrategy>> {
            Ok(Box::new(StuckStrategy))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_after_grace() {
        let deps = Arc::new(WatcherDeps {
            accounts: Arc::new(StaticAccounts { missing: vec![] }),
            anchors: Arc::new(MemoryAnchors::default()),
            cache: Arc::new(MemoryCache::default()),
            factory: Arc::new(StuckFactory),
            settings: WatcherConfig::default(),
        });
        let watcher = AccountWatcher::start(
            5,
            deps,
            Arc::new(|_| {}),
            Arc::new(RecordingListener::default()),
            &Handle::current(),
            None,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        watcher.stop().await;
        assert_eq!(started.elapsed().as_secs(), 3);
    }
}
