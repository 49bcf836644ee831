//! Common types for MailPulse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for mail accounts
pub type AccountId = i64;

/// Opaque identifier of a subscribed client session
pub type SessionId = String;

/// Provider-side message identifier (IMAP UID rendered as text, or a vendor id)
pub type MessageUid = String;

/// Name of the default per-account bus channel
pub fn account_channel(account_id: AccountId) -> String {
    format!("account.{}", account_id)
}

/// Backend protocol family of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Generic push-capable IMAP server
    Imap,
    /// Gmail REST API with a history cursor
    Gmail,
    /// Microsoft Graph with per-folder delta links
    Outlook,
}

impl ProviderKind {
    /// Map the `server_kind` column of an account to a provider kind.
    /// Unknown values are treated as plain IMAP.
    pub fn from_server_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "gmail" => ProviderKind::Gmail,
            "outlook" | "graph" | "office365" => ProviderKind::Outlook,
            _ => ProviderKind::Imap,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Imap => "imap",
            ProviderKind::Gmail => "gmail",
            ProviderKind::Outlook => "outlook",
        }
    }

    /// Vendor events carry their own metadata and never need enrichment
    pub fn is_vendor(&self) -> bool {
        !matches!(self, ProviderKind::Imap)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/starred state of a single message. `None` means "unchanged".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

impl FlagState {
    pub fn new(seen: bool, starred: bool) -> Self {
        Self {
            seen: Some(seen),
            starred: Some(starred),
        }
    }

    /// Overlay the known fields of `other` on top of `self`
    pub fn merge(&mut self, other: FlagState) {
        if other.seen.is_some() {
            self.seen = other.seen;
        }
        if other.starred.is_some() {
            self.starred = other.starred;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_none() && self.starred.is_none()
    }
}

/// Display metadata attached to `added` events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub uid: MessageUid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,
    #[serde(default, skip_serializing_if = "FlagState::is_empty")]
    pub flags: FlagState,
}

/// Lifecycle status reported through `watcher_status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatusKind {
    Started,
    Stopped,
    Error,
}

/// Discriminant of a [`ChangeEvent`], used as part of the coalescing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Added,
    Removed,
    Flags,
    Refresh,
    WatcherStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Removed => "removed",
            EventKind::Flags => "flags",
            EventKind::Refresh => "refresh",
            EventKind::WatcherStatus => "watcher_status",
        }
    }
}

/// Structured notification of a mailbox state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Added {
        account_id: AccountId,
        folder: Option<String>,
        uids: Vec<MessageUid>,
        #[serde(default)]
        metadata: Vec<MessageMeta>,
    },
    Removed {
        account_id: AccountId,
        folder: Option<String>,
        uids: Vec<MessageUid>,
    },
    #[serde(rename = "flags")]
    FlagsChanged {
        account_id: AccountId,
        folder: Option<String>,
        flags_by_uid: BTreeMap<MessageUid, FlagState>,
    },
    Refresh {
        account_id: AccountId,
        folder: Option<String>,
        hint: Option<String>,
    },
    WatcherStatus {
        account_id: AccountId,
        status: WatcherStatusKind,
        message: Option<String>,
    },
}

impl ChangeEvent {
    /// Coarse "something changed, reload" signal
    pub fn refresh(account_id: AccountId, hint: impl Into<String>) -> Self {
        ChangeEvent::Refresh {
            account_id,
            folder: None,
            hint: Some(hint.into()),
        }
    }

    pub fn status(account_id: AccountId, status: WatcherStatusKind, message: Option<String>) -> Self {
        ChangeEvent::WatcherStatus {
            account_id,
            status,
            message,
        }
    }

    pub fn account_id(&self) -> AccountId {
        match self {
            ChangeEvent::Added { account_id, .. }
            | ChangeEvent::Removed { account_id, .. }
            | ChangeEvent::FlagsChanged { account_id, .. }
            | ChangeEvent::Refresh { account_id, .. }
            | ChangeEvent::WatcherStatus { account_id, .. } => *account_id,
        }
    }

    pub fn folder(&self) -> Option<&str> {
        match self {
            ChangeEvent::Added { folder, .. }
            | ChangeEvent::Removed { folder, .. }
            | ChangeEvent::FlagsChanged { folder, .. }
            | ChangeEvent::Refresh { folder, .. } => folder.as_deref(),
            ChangeEvent::WatcherStatus { .. } => None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Added { .. } => EventKind::Added,
            ChangeEvent::Removed { .. } => EventKind::Removed,
            ChangeEvent::FlagsChanged { .. } => EventKind::Flags,
            ChangeEvent::Refresh { .. } => EventKind::Refresh,
            ChangeEvent::WatcherStatus { .. } => EventKind::WatcherStatus,
        }
    }
}

/// Per-account counters exposed through the manager status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetrics {
    pub events: u64,
    pub last_event: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub phase: Option<String>,
}
