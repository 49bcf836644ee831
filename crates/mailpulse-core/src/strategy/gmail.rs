//! Gmail history-cursor strategy

use super::{CycleOutcome, SyncStrategy, WatcherContext};
use crate::providers::gmail::{
    primary_folder, GmailApi, HistoryRecord, FOLDER_ALL, LABEL_INBOX, LABEL_SPAM, LABEL_STARRED,
    LABEL_TRASH, LABEL_UNREAD,
};
use async_trait::async_trait;
use mailpulse_common::types::{ChangeEvent, FlagState, MessageMeta, ProviderKind};
use mailpulse_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between rebuilding credentials and retrying the cycle
const AUTH_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Whether history id `candidate` is newer than `current`
fn is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => (candidate.len(), candidate) > (current.len(), current),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Move {
    id: String,
    from: Option<&'static str>,
    to: &'static str,
}

/// Changes accumulated over every history page of one cycle
#[derive(Debug, Default)]
struct HistoryDelta {
    added: Vec<String>,
    removed: Vec<String>,
    flags: BTreeMap<String, FlagState>,
    moves: Vec<Move>,
}

impl HistoryDelta {
    fn absorb(&mut self, record: HistoryRecord) {
        for entry in record.messages_added {
            if !self.added.contains(&entry.message.id) {
                self.added.push(entry.message.id);
            }
        }
        for entry in record.messages_deleted {
            if !self.removed.contains(&entry.message.id) {
                self.removed.push(entry.message.id);
            }
        }

        for entry in record.labels_added {
            let labels = &entry.label_ids;
            let has = |name: &str| labels.iter().any(|l| l == name);
            let flags = self.flags.entry(entry.message.id.clone()).or_default();
            if has(LABEL_UNREAD) {
                flags.seen = Some(false);
            }
            if has(LABEL_STARRED) {
                flags.starred = Some(true);
            }
            let target = primary_folder(labels);
            if target == LABEL_TRASH || target == LABEL_SPAM {
                self.moves.push(Move {
                    id: entry.message.id,
                    from: None,
                    to: target,
                });
            }
        }

        for entry in record.labels_removed {
            let labels = &entry.label_ids;
            let has = |name: &str| labels.iter().any(|l| l == name);
            let flags = self.flags.entry(entry.message.id.clone()).or_default();
            if has(LABEL_UNREAD) {
                flags.seen = Some(true);
            }
            if has(LABEL_STARRED) {
                flags.starred = Some(false);
            }
            if has(LABEL_INBOX) {
                self.moves.push(Move {
                    id: entry.message.id,
                    from: Some(LABEL_INBOX),
                    to: FOLDER_ALL,
                });
            }
        }
    }

    fn changed_flags(&self) -> BTreeMap<String, FlagState> {
        self.flags
            .iter()
            .filter(|(_, state)| !state.is_empty())
            .map(|(id, state)| (id.clone(), *state))
            .collect()
    }
}

pub struct GmailStrategy {
    api: Box<dyn GmailApi>,
    anchor: Option<String>,
}

impl GmailStrategy {
    pub fn new(api: Box<dyn GmailApi>) -> Self {
        Self { api, anchor: None }
    }

    async fn current_anchor(&mut self, ctx: &WatcherContext) -> Result<String> {
        if let Some(anchor) = &self.anchor {
            return Ok(anchor.clone());
        }
        match ctx.anchors.get_history_id(ctx.account_id).await? {
            Some(stored) if !stored.is_empty() => {
                self.anchor = Some(stored.clone());
                Ok(stored)
            }
            _ => self.reinitialize(ctx).await,
        }
    }

    /// Restart history from the newest message; the only path that may move the anchor back
    async fn reinitialize(&mut self, ctx: &WatcherContext) -> Result<String> {
        let head = self
            .api
            .head_history_id()
            .await?
            .unwrap_or_else(|| "0".to_string());
        ctx.anchors.set_history_id(ctx.account_id, &head).await?;
        info!(account_id = ctx.account_id, history_id = %head, "Gmail anchor initialised");
        self.anchor = Some(head.clone());
        Ok(head)
    }

    async fn sync(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome> {
        let account_id = ctx.account_id;
        let start = self.current_anchor(ctx).await?;

        let mut delta = HistoryDelta::default();
        let mut newest = start.clone();
        let mut records = 0usize;
        let mut page_token: Option<String> = None;

        loop {
            let page = self.api.history_page(&start, page_token.as_deref()).await?;
            for record in page.history {
                records += 1;
                if is_newer(&record.id, &newest) {
                    newest = record.id.clone();
                }
                delta.absorb(record);
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if records == 0 {
            return Ok(CycleOutcome::Quiet);
        }
        debug!(account_id, records, start = %start, newest = %newest, "Gmail history read");

        self.emit_changes(ctx, &delta).await?;

        if is_newer(&newest, &start) {
            ctx.anchors.set_history_id(account_id, &newest).await?;
            self.anchor = Some(newest);
        }

        Ok(CycleOutcome::Changed)
    }

    async fn emit_changes(&mut self, ctx: &WatcherContext, delta: &HistoryDelta) -> Result<()> {
        let account_id = ctx.account_id;

        if !delta.added.is_empty() {
            let metadata = self.api.messages_meta(&delta.added).await?;
            if !metadata.is_empty() {
                ctx.emit(ChangeEvent::Added {
                    account_id,
                    folder: None,
                    uids: metadata.iter().map(|m| m.uid.clone()).collect(),
                    metadata,
                });
            }
        }

        if !delta.removed.is_empty() {
            ctx.emit(ChangeEvent::Removed {
                account_id,
                folder: None,
                uids: delta.removed.clone(),
            });
        }

        let flags_by_uid = delta.changed_flags();
        if !flags_by_uid.is_empty() {
            ctx.emit(ChangeEvent::FlagsChanged {
                account_id,
                folder: None,
                flags_by_uid,
            });
        }

        if delta.moves.is_empty() {
            return Ok(());
        }

        let mut moved: Vec<String> = Vec::new();
        for m in &delta.moves {
            if !moved.contains(&m.id) {
                moved.push(m.id.clone());
            }
        }
        let meta_by_id: HashMap<String, MessageMeta> = self
            .api
            .messages_meta(&moved)
            .await?
            .into_iter()
            .map(|m| (m.uid.clone(), m))
            .collect();

        for m in &delta.moves {
            if let Some(source) = m.from {
                ctx.emit(ChangeEvent::Removed {
                    account_id,
                    folder: Some(source.to_string()),
                    uids: vec![m.id.clone()],
                });
            }
            ctx.emit(ChangeEvent::Added {
                account_id,
                folder: Some(m.to.to_string()),
                uids: vec![m.id.clone()],
                metadata: meta_by_id.get(&m.id).cloned().into_iter().collect(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl SyncStrategy for GmailStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn run_cycle(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome> {
        let account_id = ctx.account_id;

        let result = match self.sync(ctx).await {
            Err(Error::AuthExpired(reason)) => {
                warn!(account_id, "Gmail credentials rejected, re-authenticating: {}", reason);
                self.api.reauthenticate();
                if !ctx.pause(AUTH_RETRY_PAUSE).await {
                    return Ok(CycleOutcome::Closed);
                }
                self.sync(ctx).await
            }
            other => other,
        };

        match result {
            Err(Error::AnchorInvalid(reason)) => {
                warn!(account_id, "Gmail history anchor rejected, resetting: {}", reason);
                self.anchor = None;
                self.reinitialize(ctx).await?;
                ctx.emit(ChangeEvent::refresh(account_id, "resync"));
                // A fresh anchor has nothing pending behind it
                Ok(CycleOutcome::Quiet)
            }
            other => other,
        }
    }
}
