//! Push-capable IMAP strategy
//!
//! Watches INBOX with IDLE when the server advertises it and falls back to
//! STATUS polling otherwise. A cycle lasts as long as the connection.

use super::{CycleOutcome, SyncStrategy, WatcherContext};
use crate::providers::imap::{compact_sequence_set, FetchedFlags, IdleWait, PushConnector, PushSession, Untagged};
use async_trait::async_trait;
use mailpulse_common::config::WatcherConfig;
use mailpulse_common::types::{ChangeEvent, FlagState, MessageUid, ProviderKind};
use mailpulse_common::{Error, Result};
use mailpulse_storage::models::AccountConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const INBOX: &str = "INBOX";

/// Why an IDLE round ended
enum IdleExit {
    /// Re-enter IDLE
    Resume,
    /// IDLE is unusable on this session
    Polling,
    Cancelled,
}

pub struct ImapStrategy {
    account: AccountConfig,
    connector: Arc<dyn PushConnector>,
    wait_slice: Duration,
    keepalive: Duration,
    poll_interval: Duration,
}

impl ImapStrategy {
    pub fn new(account: AccountConfig, connector: Arc<dyn PushConnector>, timing: &WatcherConfig) -> Self {
        Self {
            account,
            connector,
            wait_slice: timing.idle_wait_slice(),
            keepalive: timing.idle_keepalive(),
            poll_interval: timing.poll_interval(),
        }
    }

    async fn watch(&self, session: &mut dyn PushSession, ctx: &WatcherContext) -> Result<CycleOutcome> {
        let account_id = ctx.account_id;

        if session.capabilities().utf8_accept() {
            if let Err(e) = session.enable_utf8().await {
                debug!(account_id, "ENABLE UTF8=ACCEPT refused: {}", e);
            }
        }

        safe_select(session, INBOX).await?;

        let mut marker = None;
        self.check_new(session, ctx, &mut marker, true).await;
        info!(account_id, uid_next = ?marker, "IMAP baseline taken");

        let mut idle = session.capabilities().idle();
        if !idle {
            info!(account_id, "IDLE not advertised, polling");
        }
        let mut last_keepalive = Instant::now();

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(CycleOutcome::Closed);
            }

            if idle {
                if let Err(e) = session.idle_start().await {
                    info!(account_id, "Cannot start IDLE, polling: {}", e);
                    idle = false;
                    continue;
                }
                match self.idle_round(session, ctx, &mut marker, &mut last_keepalive).await? {
                    IdleExit::Resume => {}
                    IdleExit::Polling => idle = false,
                    IdleExit::Cancelled => return Ok(CycleOutcome::Closed),
                }
                continue;
            }

            if !ctx.pause(self.poll_interval).await {
                return Ok(CycleOutcome::Closed);
            }
            debug!(account_id, "Poll tick");
            self.check_new(session, ctx, &mut marker, false).await;
            session.noop().await?;
        }
    }

    /// Wait in IDLE until something worth handling arrives
    async fn idle_round(
        &self,
        session: &mut dyn PushSession,
        ctx: &WatcherContext,
        marker: &mut Option<u32>,
        last_keepalive: &mut Instant,
    ) -> Result<IdleExit> {
        let account_id = ctx.account_id;

        loop {
            let wait = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    if let Err(e) = session.idle_done().await {
                        debug!(account_id, "DONE on cancel failed: {}", e);
                    }
                    return Ok(IdleExit::Cancelled);
                }
                wait = session.idle_wait(self.wait_slice) => wait,
            };

            match wait {
                IdleWait::TimedOut => {}
                IdleWait::Failed(e) => {
                    let _ = session.idle_done().await;
                    // A live session answers NOOP; a dead one goes back to the watcher
                    session.noop().await?;
                    info!(account_id, "IDLE failed, polling: {}", e);
                    return Ok(IdleExit::Polling);
                }
                IdleWait::Notified(responses) => {
                    if let Some(text) = responses.iter().find_map(|r| match r {
                        Untagged::Bye(text) => Some(text.clone()),
                        _ => None,
                    }) {
                        return Err(Error::TransientProtocol(format!("server closed session: {}", text)));
                    }

                    if responses.iter().any(|r| matches!(r, Untagged::Exists(_))) {
                        debug!(account_id, "EXISTS, resyncing");
                        leave_idle(session).await;
                        safe_select(session, INBOX).await?;
                        self.check_new(session, ctx, marker, false).await;
                        return Ok(IdleExit::Resume);
                    }

                    if responses.iter().any(|r| matches!(r, Untagged::Expunge(_))) {
                        debug!(account_id, "EXPUNGE, refreshing");
                        leave_idle(session).await;
                        ctx.emit(ChangeEvent::Refresh {
                            account_id,
                            folder: Some(INBOX.to_string()),
                            hint: Some("expunge".to_string()),
                        });
                        match session.status(INBOX).await {
                            Ok(status) => {
                                if let Some(next) = status.uid_next {
                                    *marker = Some(next);
                                }
                            }
                            Err(e) => warn!(account_id, "STATUS after EXPUNGE failed: {}", e),
                        }
                        return Ok(IdleExit::Resume);
                    }

                    let changed: BTreeSet<u32> = responses
                        .iter()
                        .filter_map(|r| match r {
                            Untagged::Fetch { seq, flags: Some(_), .. } => Some(*seq),
                            _ => None,
                        })
                        .collect();
                    if !changed.is_empty() {
                        leave_idle(session).await;
                        let set = compact_sequence_set(&changed.into_iter().collect::<Vec<_>>());
                        debug!(account_id, set = %set, "Flag change, fetching");
                        let fetched = session.fetch_flags(&set).await?;
                        apply_flag_changes(ctx, fetched).await;
                        return Ok(IdleExit::Resume);
                    }
                }
            }

            if last_keepalive.elapsed() >= self.keepalive {
                debug!(account_id, "IDLE keepalive");
                leave_idle(session).await;
                if let Err(e) = session.noop().await {
                    debug!(account_id, "Keepalive NOOP failed: {}", e);
                }
                *last_keepalive = Instant::now();
                return Ok(IdleExit::Resume);
            }
        }
    }

    /// Compare UIDNEXT against the marker and announce new UIDs. Without a
    /// marker the new UIDs are unknown, so anything after the baseline asks
    /// for a refresh instead.
    async fn check_new(
        &self,
        session: &mut dyn PushSession,
        ctx: &WatcherContext,
        marker: &mut Option<u32>,
        baseline: bool,
    ) {
        let account_id = ctx.account_id;
        let status = match session.status(INBOX).await {
            Ok(status) => status,
            Err(e) => {
                warn!(account_id, "STATUS failed: {}", e);
                ctx.emit(ChangeEvent::Refresh {
                    account_id,
                    folder: Some(INBOX.to_string()),
                    hint: Some("status".to_string()),
                });
                return;
            }
        };

        let Some(next) = status.uid_next else {
            return;
        };
        match *marker {
            Some(from) if next > from => {
                let uids = new_uids(session, from, next).await;
                info!(account_id, from, to = next, "New messages");
                ctx.emit(ChangeEvent::Added {
                    account_id,
                    folder: Some(INBOX.to_string()),
                    uids,
                    metadata: Vec::new(),
                });
            }
            Some(_) => {}
            None if !baseline => {
                info!(account_id, uid_next = next, "Baseline recovered, refreshing");
                ctx.emit(ChangeEvent::Refresh {
                    account_id,
                    folder: Some(INBOX.to_string()),
                    hint: Some("exists".to_string()),
                });
            }
            None => {}
        }
        *marker = Some(next);
    }
}

#[async_trait]
impl SyncStrategy for ImapStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn run_cycle(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome> {
        let mut session = self.connector.connect(&self.account).await?;
        let outcome = self.watch(session.as_mut(), ctx).await;
        if let Err(e) = session.logout().await {
            debug!(account_id = ctx.account_id, "LOGOUT failed: {}", e);
        }
        outcome
    }
}

async fn leave_idle(session: &mut dyn PushSession) {
    if let Err(e) = session.idle_done().await {
        debug!("DONE failed: {}", e);
    }
}

/// Select `mailbox`, degrading through EXAMINE and delimiter variants
async fn safe_select(session: &mut dyn PushSession, mailbox: &str) -> Result<()> {
    if session.select(mailbox).await.is_ok() {
        return Ok(());
    }
    if session.examine(mailbox).await.is_ok() {
        return Ok(());
    }

    if let Some(delimiter) = session.delimiter() {
        let alternate: String = mailbox
            .chars()
            .map(|c| if c == '/' || c == '.' || c == '\\' { delimiter } else { c })
            .collect();
        if alternate != mailbox && session.select(&alternate).await.is_ok() {
            return Ok(());
        }
    }

    if session.select(INBOX).await.is_ok() {
        return Ok(());
    }
    session.examine(INBOX).await
}

/// UIDs in `[from, next)`, preferring what the server reports
async fn new_uids(session: &mut dyn PushSession, from: u32, next: u32) -> Vec<MessageUid> {
    let found = match session.uid_search(&format!("UID {}:*", from)).await {
        Ok(uids) => uids
            .into_iter()
            .filter(|uid| *uid >= from && *uid < next)
            .collect::<BTreeSet<_>>(),
        Err(e) => {
            debug!("UID SEARCH failed, using UIDNEXT range: {}", e);
            BTreeSet::new()
        }
    };

    if found.is_empty() {
        (from..next).map(|uid| uid.to_string()).collect()
    } else {
        found.into_iter().map(|uid| uid.to_string()).collect()
    }
}

async fn apply_flag_changes(ctx: &WatcherContext, fetched: Vec<FetchedFlags>) {
    let account_id = ctx.account_id;
    let mut flags_by_uid = BTreeMap::new();
    let mut removed = Vec::new();

    for message in fetched {
        if message.deleted() {
            removed.push(message.uid.to_string());
        } else {
            flags_by_uid.insert(
                message.uid.to_string(),
                FlagState::new(message.seen(), message.flagged()),
            );
        }
    }

    if !flags_by_uid.is_empty() {
        if let Err(e) = ctx.cache.update_flags(account_id, Some(INBOX), &flags_by_uid).await {
            warn!(account_id, "Flag overlay update failed: {}", e);
        }
        ctx.emit(ChangeEvent::FlagsChanged {
            account_id,
            folder: Some(INBOX.to_string()),
            flags_by_uid,
        });
    }

    if !removed.is_empty() {
        if let Err(e) = ctx.cache.remove_uids(account_id, Some(INBOX), &removed).await {
            warn!(account_id, "Removal overlay update failed: {}", e);
        }
        ctx.emit(ChangeEvent::Removed {
            account_id,
            folder: Some(INBOX.to_string()),
            uids: removed,
        });
    }
}
