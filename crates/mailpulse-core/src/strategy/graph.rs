//! Microsoft Graph delta-link strategy
//!
//! One delta cursor per tracked folder, or a single mailbox-wide cursor when
//! the folder list holds `__ALL__`. Moves are detected by comparing each
//! message's parent folder with the last one seen.

use super::{CycleOutcome, SyncStrategy, WatcherContext};
use crate::providers::graph::{well_known_folder, GraphApi, GraphMessage};
use async_trait::async_trait;
use mailpulse_common::config::GLOBAL_FOLDER;
use mailpulse_common::types::{ChangeEvent, FlagState, MessageMeta, ProviderKind};
use mailpulse_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// What a delta cursor covers
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Mailbox,
    Folder { name: String, id: String },
}

impl Scope {
    /// Key of the cursor in the stored token map
    fn key(&self) -> &str {
        match self {
            Scope::Mailbox => GLOBAL_FOLDER,
            Scope::Folder { id, .. } => id,
        }
    }

    fn folder_id(&self) -> Option<&str> {
        match self {
            Scope::Mailbox => None,
            Scope::Folder { id, .. } => Some(id),
        }
    }

    /// Folder reported on events
    fn label(&self) -> Option<String> {
        match self {
            Scope::Mailbox => None,
            Scope::Folder { name, .. } => Some(name.clone()),
        }
    }
}

struct FolderMove {
    id: String,
    from: String,
    to: String,
}

pub struct GraphStrategy {
    api: Box<dyn GraphApi>,
    folders: Vec<String>,
    folder_ids: HashMap<String, String>,
    folder_names: HashMap<String, String>,
}

impl GraphStrategy {
    pub fn new(api: Box<dyn GraphApi>, folders: Vec<String>) -> Self {
        Self {
            api,
            folders,
            folder_ids: HashMap::new(),
            folder_names: HashMap::new(),
        }
    }

    async fn scopes(&mut self) -> Result<Vec<Scope>> {
        if self.folders.is_empty() || self.folders.iter().any(|f| f == GLOBAL_FOLDER) {
            return Ok(vec![Scope::Mailbox]);
        }

        let mut scopes = Vec::with_capacity(self.folders.len());
        for name in &self.folders {
            if let Some(id) = self.folder_ids.get(name) {
                scopes.push(Scope::Folder {
                    name: name.clone(),
                    id: id.clone(),
                });
                continue;
            }

            let lookup = well_known_folder(name).unwrap_or(name.as_str());
            match self.api.folder_id(lookup).await {
                Ok(id) => {
                    self.folder_ids.insert(name.clone(), id.clone());
                    scopes.push(Scope::Folder {
                        name: name.clone(),
                        id,
                    });
                }
                Err(Error::NotFound(_)) => debug!(folder = %name, "Folder not present in mailbox"),
                Err(e) => return Err(e),
            }
        }
        Ok(scopes)
    }

    async fn folder_name(&mut self, folder_id: &str) -> Option<String> {
        if let Some(name) = self.folder_names.get(folder_id) {
            return Some(name.clone());
        }
        match self.api.folder_name(folder_id).await {
            Ok(Some(name)) => {
                self.folder_names.insert(folder_id.to_string(), name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(folder_id, "Folder name lookup failed: {}", e);
                None
            }
        }
    }

    /// Drain one cursor. Returns whether anything was emitted.
    async fn sync_scope(
        &mut self,
        ctx: &WatcherContext,
        scope: &Scope,
        tokens: &mut HashMap<String, String>,
        parents: &mut HashMap<String, String>,
    ) -> Result<bool> {
        let account_id = ctx.account_id;
        let folder = scope.label();

        let mut link = tokens.get(scope.key()).cloned();
        let mut delta_link = None;
        let mut removed: Vec<String> = Vec::new();
        let mut flags_by_uid: BTreeMap<String, FlagState> = BTreeMap::new();
        let mut changed: Vec<GraphMessage> = Vec::new();
        let mut moves: Vec<FolderMove> = Vec::new();
        // Parent folders seen on this cursor, kept out of the cache until emitted
        let mut seen_parents: HashMap<String, String> = HashMap::new();

        loop {
            let page = self.api.delta_page(scope.folder_id(), link.as_deref()).await?;

            for item in page.value {
                if item.is_removed() {
                    if !removed.contains(&item.id) {
                        removed.push(item.id);
                    }
                    continue;
                }

                flags_by_uid.insert(item.id.clone(), item.flags());

                if let Some(parent) = item.parent_folder_id.as_deref() {
                    let previous = match seen_parents.get(&item.id).or_else(|| parents.get(&item.id)) {
                        Some(known) => Some(known.clone()),
                        None => ctx.cache.get_parent_folder(account_id, &item.id).await?,
                    };
                    if let Some(previous) = previous.filter(|p| p != parent) {
                        moves.push(FolderMove {
                            id: item.id.clone(),
                            from: previous,
                            to: parent.to_string(),
                        });
                    }
                    seen_parents.insert(item.id.clone(), parent.to_string());
                }

                match changed.iter_mut().find(|m| m.id == item.id) {
                    Some(existing) => *existing = item,
                    None => changed.push(item),
                }
            }

            if page.delta_link.is_some() {
                delta_link = page.delta_link;
            }
            match page.next_link {
                Some(next) => link = Some(next),
                None => break,
            }
        }

        let mut emitted = false;

        if !changed.is_empty() {
            let metadata = self.metadata(&changed, folder.clone()).await?;
            if !metadata.is_empty() {
                ctx.emit(ChangeEvent::Added {
                    account_id,
                    folder: folder.clone(),
                    uids: metadata.iter().map(|m| m.uid.clone()).collect(),
                    metadata,
                });
                emitted = true;
            }
        }

        if !removed.is_empty() {
            if let Err(e) = ctx.cache.remove_uids(account_id, folder.as_deref(), &removed).await {
                warn!(account_id, "Removal overlay update failed: {}", e);
            }
            ctx.emit(ChangeEvent::Removed {
                account_id,
                folder: folder.clone(),
                uids: removed,
            });
            emitted = true;
        }

        if !flags_by_uid.is_empty() {
            if let Err(e) = ctx
                .cache
                .update_flags(account_id, folder.as_deref(), &flags_by_uid)
                .await
            {
                warn!(account_id, "Flag overlay update failed: {}", e);
            }
            ctx.emit(ChangeEvent::FlagsChanged {
                account_id,
                folder: folder.clone(),
                flags_by_uid,
            });
            emitted = true;
        }

        for m in moves {
            let source = self.folder_name(&m.from).await;
            let target = self.folder_name(&m.to).await;
            if let Some(source) = source {
                ctx.emit(ChangeEvent::Removed {
                    account_id,
                    folder: Some(source),
                    uids: vec![m.id.clone()],
                });
            }
            ctx.emit(ChangeEvent::Added {
                account_id,
                folder: target,
                uids: vec![m.id],
                metadata: Vec::new(),
            });
            emitted = true;
        }

        parents.extend(seen_parents);
        if let Some(delta_link) = delta_link {
            tokens.insert(scope.key().to_string(), delta_link);
        }

        Ok(emitted)
    }

    /// Metadata for changed items, fetching the ones delta returned sparse
    async fn metadata(&mut self, items: &[GraphMessage], folder: Option<String>) -> Result<Vec<MessageMeta>> {
        let sparse: Vec<String> = items
            .iter()
            .filter(|m| !m.has_display_fields())
            .map(|m| m.id.clone())
            .collect();

        let fetched: HashMap<String, GraphMessage> = if sparse.is_empty() {
            HashMap::new()
        } else {
            self.api
                .messages(&sparse)
                .await?
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect()
        };

        Ok(items
            .iter()
            .filter_map(|item| {
                if item.has_display_fields() {
                    Some(item.to_meta(folder.clone()))
                } else {
                    fetched.get(&item.id).map(|full| full.to_meta(folder.clone()))
                }
            })
            .collect())
    }
}

#[async_trait]
impl SyncStrategy for GraphStrategy {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn run_cycle(&mut self, ctx: &WatcherContext) -> Result<CycleOutcome> {
        let account_id = ctx.account_id;
        let mut tokens = ctx.anchors.get_delta_tokens(account_id).await?;
        let mut parents: HashMap<String, String> = HashMap::new();
        let mut changed = false;

        let scopes = match self.scopes().await {
            Ok(scopes) => scopes,
            Err(e @ Error::AuthExpired(_)) => {
                self.api.reauthenticate();
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        for scope in &scopes {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.sync_scope(ctx, scope, &mut tokens, &mut parents).await {
                Ok(emitted) => changed |= emitted,
                Err(Error::AnchorInvalid(reason)) => {
                    warn!(account_id, cursor = scope.key(), "Delta token rejected, restarting: {}", reason);
                    tokens.remove(scope.key());
                    ctx.emit(ChangeEvent::Refresh {
                        account_id,
                        folder: scope.label(),
                        hint: Some("resync".to_string()),
                    });
                    changed = true;
                }
                Err(e @ Error::AuthExpired(_)) => {
                    self.api.reauthenticate();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        // The parent cache moves forward together with the delta tokens
        for (message_id, folder_id) in &parents {
            ctx.cache.set_parent_folder(account_id, message_id, folder_id).await?;
        }
        ctx.anchors.set_delta_tokens(account_id, &tokens).await?;

        Ok(if changed {
            CycleOutcome::Changed
        } else {
            CycleOutcome::Quiet
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::graph::{DeltaPage, FollowupFlag};
    use crate::strategy::testing::Harness;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Request = (Option<String>, Option<String>);

    #[derive(Default)]
    struct FakeGraph {
        folder_ids: HashMap<String, String>,
        names: HashMap<String, String>,
        pages: VecDeque<Result<DeltaPage>>,
        full: HashMap<String, GraphMessage>,
        requests: Arc<Mutex<Vec<Request>>>,
        fetched: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GraphApi for FakeGraph {
        async fn folder_id(&mut self, well_known: &str) -> Result<String> {
            self.folder_ids
                .get(well_known)
                .cloned()
                .ok_or_else(|| Error::NotFound(well_known.to_string()))
        }

        async fn folder_name(&mut self, folder_id: &str) -> Result<Option<String>> {
            Ok(self.names.get(folder_id).cloned())
        }

        async fn delta_page(&mut self, folder_id: Option<&str>, link: Option<&str>) -> Result<DeltaPage> {
            self.requests
                .lock()
                .unwrap()
                .push((folder_id.map(str::to_string), link.map(str::to_string)));
            self.pages.pop_front().unwrap_or_else(|| Ok(DeltaPage::default()))
        }

        async fn messages(&mut self, ids: &[String]) -> Result<Vec<GraphMessage>> {
            self.fetched.lock().unwrap().extend(ids.iter().cloned());
            Ok(ids.iter().filter_map(|id| self.full.get(id).cloned()).collect())
        }

        fn reauthenticate(&mut self) {}
    }

    fn full_message(id: &str, parent: &str, read: bool) -> GraphMessage {
        GraphMessage {
            id: id.into(),
            subject: Some(format!("subject {}", id)),
            received_date_time: Some("2024-05-01T10:00:00Z".into()),
            parent_folder_id: Some(parent.into()),
            is_read: Some(read),
            flag: Some(FollowupFlag {
                flag_status: Some("notFlagged".into()),
            }),
            ..Default::default()
        }
    }

    fn tombstone(id: &str) -> GraphMessage {
        GraphMessage {
            id: id.into(),
            removed: Some(serde_json::json!({"reason": "deleted"})),
            ..Default::default()
        }
    }

    fn inbox_fake() -> FakeGraph {
        FakeGraph {
            folder_ids: HashMap::from([("inbox".to_string(), "inbox-id".to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initial_folder_sync_stores_delta_link() {
        let harness = Harness::new(11);
        let mut fake = inbox_fake();
        fake.pages = VecDeque::from([
            Ok(DeltaPage {
                value: vec![full_message("m1", "inbox-id", false)],
                next_link: Some("next-1".into()),
                delta_link: None,
            }),
            Ok(DeltaPage {
                value: vec![tombstone("m2")],
                next_link: None,
                delta_link: Some("delta-1".into()),
            }),
            // second cycle
            Ok(DeltaPage {
                value: vec![],
                next_link: None,
                delta_link: Some("delta-2".into()),
            }),
        ]);
        let requests = fake.requests.clone();

        let mut strategy = GraphStrategy::new(Box::new(fake), vec!["INBOX".into()]);
        assert_eq!(strategy.run_cycle(&harness.ctx).await.unwrap(), CycleOutcome::Changed);

        let events = harness.take_events();
        assert_eq!(events.len(), 3);
        match &events[0] {
            ChangeEvent::Added {
                folder, uids, metadata, ..
            } => {
                assert_eq!(folder.as_deref(), Some("INBOX"));
                assert_eq!(uids, &vec!["m1".to_string()]);
                assert_eq!(metadata[0].subject.as_deref(), Some("subject m1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events[1],
            ChangeEvent::Removed {
                account_id: 11,
                folder: Some("INBOX".into()),
                uids: vec!["m2".into()],
            }
        );
        assert_eq!(
            events[2],
            ChangeEvent::FlagsChanged {
                account_id: 11,
                folder: Some("INBOX".into()),
                flags_by_uid: BTreeMap::from([("m1".to_string(), FlagState::new(false, false))]),
            }
        );
        assert_eq!(
            harness.cache.parents.lock().unwrap().get("m1").cloned(),
            Some("inbox-id".to_string())
        );

        assert_eq!(strategy.run_cycle(&harness.ctx).await.unwrap(), CycleOutcome::Quiet);
        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                (Some("inbox-id".to_string()), None),
                (Some("inbox-id".to_string()), Some("next-1".to_string())),
                (Some("inbox-id".to_string()), Some("delta-1".to_string())),
            ]
        );
        assert_eq!(
            harness.anchors.deltas.lock().unwrap()[&11],
            HashMap::from([("inbox-id".to_string(), "delta-2".to_string())])
        );
    }

    #[tokio::test]
    async fn test_parent_change_is_reported_as_move() {
        let harness = Harness::new(12);
        harness
            .cache
            .parents
            .lock()
            .unwrap()
            .insert("m3".into(), "inbox-id".into());

        let mut fake = inbox_fake();
        fake.names = HashMap::from([
            ("inbox-id".to_string(), "Inbox".to_string()),
            ("archive-id".to_string(), "Archive".to_string()),
        ]);
        fake.pages = VecDeque::from([Ok(DeltaPage {
            value: vec![full_message("m3", "archive-id", true)],
            next_link: None,
            delta_link: Some("delta".into()),
        })]);

        GraphStrategy::new(Box::new(fake), vec!["INBOX".into()])
            .run_cycle(&harness.ctx)
            .await
            .unwrap();

        let events = harness.take_events();
        assert_eq!(
            &events[2..],
            &[
                ChangeEvent::Removed {
                    account_id: 12,
                    folder: Some("Inbox".into()),
                    uids: vec!["m3".into()],
                },
                ChangeEvent::Added {
                    account_id: 12,
                    folder: Some("Archive".into()),
                    uids: vec!["m3".into()],
                    metadata: vec![],
                },
            ]
        );
        assert_eq!(
            harness.cache.parents.lock().unwrap().get("m3").cloned(),
            Some("archive-id".to_string())
        );
    }

    #[tokio::test]
    async fn test_move_survives_failed_page() {
        let harness = Harness::new(16);
        harness
            .cache
            .parents
            .lock()
            .unwrap()
            .insert("m3".into(), "inbox-id".into());

        let mut fake = inbox_fake();
        fake.names = HashMap::from([
            ("inbox-id".to_string(), "Inbox".to_string()),
            ("archive-id".to_string(), "Archive".to_string()),
        ]);
        fake.pages = VecDeque::from([
            Ok(DeltaPage {
                value: vec![full_message("m3", "archive-id", true)],
                next_link: Some("next-1".into()),
                delta_link: None,
            }),
            Err(Error::TransientProtocol("connection reset".into())),
            // replay from the stored token
            Ok(DeltaPage {
                value: vec![full_message("m3", "archive-id", true)],
                next_link: None,
                delta_link: Some("delta".into()),
            }),
        ]);
        let requests = fake.requests.clone();

        let mut strategy = GraphStrategy::new(Box::new(fake), vec!["INBOX".into()]);
        let err = strategy.run_cycle(&harness.ctx).await.unwrap_err();
        assert!(matches!(err, Error::TransientProtocol(_)));
        assert!(harness.take_events().is_empty());
        assert_eq!(
            harness.cache.parents.lock().unwrap().get("m3").cloned(),
            Some("inbox-id".to_string())
        );

        strategy.run_cycle(&harness.ctx).await.unwrap();
        assert_eq!(requests.lock().unwrap()[2], (Some("inbox-id".to_string()), None));

        let events = harness.take_events();
        assert!(events.contains(&ChangeEvent::Removed {
            account_id: 16,
            folder: Some("Inbox".into()),
            uids: vec!["m3".into()],
        }));
        assert!(events.contains(&ChangeEvent::Added {
            account_id: 16,
            folder: Some("Archive".into()),
            uids: vec!["m3".into()],
            metadata: vec![],
        }));
        assert_eq!(
            harness.cache.parents.lock().unwrap().get("m3").cloned(),
            Some("archive-id".to_string())
        );
    }

    #[tokio::test]
    async fn test_sparse_items_are_fetched() {
        let harness = Harness::new(13);
        let mut fake = inbox_fake();
        fake.full = HashMap::from([("m4".to_string(), full_message("m4", "inbox-id", true))]);
        fake.pages = VecDeque::from([Ok(DeltaPage {
            value: vec![GraphMessage {
                id: "m4".into(),
                is_read: Some(true),
                ..Default::default()
            }],
            next_link: None,
            delta_link: Some("delta".into()),
        })]);
        let fetched = fake.fetched.clone();

        GraphStrategy::new(Box::new(fake), vec!["INBOX".into()])
            .run_cycle(&harness.ctx)
            .await
            .unwrap();

        assert_eq!(*fetched.lock().unwrap(), vec!["m4".to_string()]);
        match &harness.take_events()[0] {
            ChangeEvent::Added { metadata, .. } => {
                assert_eq!(metadata[0].subject.as_deref(), Some("subject m4"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_token_is_dropped() {
        let harness = Harness::new(14);
        harness.anchors.deltas.lock().unwrap().insert(
            14,
            HashMap::from([("inbox-id".to_string(), "stale".to_string())]),
        );

        let mut fake = inbox_fake();
        fake.pages = VecDeque::from([Err(Error::AnchorInvalid("410 Gone".into()))]);
        let requests = fake.requests.clone();

        let mut strategy = GraphStrategy::new(Box::new(fake), vec!["INBOX".into()]);
        assert_eq!(strategy.run_cycle(&harness.ctx).await.unwrap(), CycleOutcome::Changed);
        assert_eq!(
            harness.take_events(),
            vec![ChangeEvent::Refresh {
                account_id: 14,
                folder: Some("INBOX".into()),
                hint: Some("resync".into()),
            }]
        );
        assert!(harness.anchors.deltas.lock().unwrap()[&14].is_empty());

        strategy.run_cycle(&harness.ctx).await.unwrap();
        assert_eq!(
            requests.lock().unwrap()[1],
            (Some("inbox-id".to_string()), None)
        );
    }

    #[tokio::test]
    async fn test_global_cursor() {
        let harness = Harness::new(15);
        let fake = FakeGraph {
            pages: VecDeque::from([Ok(DeltaPage {
                value: vec![tombstone("m9")],
                next_link: None,
                delta_link: Some("all-delta".into()),
            })]),
            ..Default::default()
        };
        let requests = fake.requests.clone();

        GraphStrategy::new(Box::new(fake), vec![GLOBAL_FOLDER.into()])
            .run_cycle(&harness.ctx)
            .await
            .unwrap();

        assert_eq!(*requests.lock().unwrap(), vec![(None, None)]);
        assert_eq!(
            harness.take_events(),
            vec![ChangeEvent::Removed {
                account_id: 15,
                folder: None,
                uids: vec!["m9".into()],
            }]
        );
        assert_eq!(
            harness.anchors.deltas.lock().unwrap()[&15],
            HashMap::from([(GLOBAL_FOLDER.to_string(), "all-delta".to_string())])
        );
    }
}
