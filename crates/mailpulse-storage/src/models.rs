//! Database models

use chrono::{DateTime, Utc};
use mailpulse_common::types::{AccountId, FlagState, MessageMeta, ProviderKind};
use mailpulse_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// Default IMAPS port
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Mail account row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: AccountId,
    pub name: String,
    pub server_kind: String,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub use_tls: bool,
    pub login: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing)]
    pub oauth_refresh_token: Option<String>,
    pub gmail_last_history_id: Option<String>,
    pub outlook_delta_tokens: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailAccount {
    pub fn provider_kind(&self) -> ProviderKind {
        ProviderKind::from_server_kind(&self.server_kind)
    }

    /// Resolve the connection settings a watcher needs.
    ///
    /// Missing host or credentials yield [`Error::Configuration`], which the
    /// watcher treats like any other failed cycle.
    pub fn to_config(&self) -> Result<AccountConfig> {
        let kind = self.provider_kind();
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();

        let credential = match kind {
            ProviderKind::Imap => {
                let login = non_empty(&self.login).ok_or_else(|| {
                    Error::Configuration(format!("account {} has no login", self.id))
                })?;
                let password = non_empty(&self.password).ok_or_else(|| {
                    Error::Configuration(format!("account {} has no password", self.id))
                })?;
                Credential::Password { login, password }
            }
            ProviderKind::Gmail | ProviderKind::Outlook => {
                let refresh_token = non_empty(&self.oauth_refresh_token).ok_or_else(|| {
                    Error::Configuration(format!("account {} has no OAuth refresh token", self.id))
                })?;
                Credential::OAuth {
                    login: non_empty(&self.login),
                    refresh_token,
                }
            }
        };

        let host = match kind {
            ProviderKind::Imap => Some(non_empty(&self.host).ok_or_else(|| {
                Error::Configuration(format!("account {} has no IMAP host", self.id))
            })?),
            _ => non_empty(&self.host),
        };

        let port = match self.port {
            Some(p) if p > 0 && p <= u16::MAX as i32 => p as u16,
            _ => DEFAULT_IMAP_PORT,
        };

        Ok(AccountConfig {
            account_id: self.id,
            kind,
            host,
            port,
            use_tls: self.use_tls,
            credential,
        })
    }

    /// Stored delta tokens keyed by folder key
    pub fn delta_tokens(&self) -> HashMap<String, String> {
        serde_json::from_value(self.outlook_delta_tokens.clone()).unwrap_or_default()
    }
}

/// How a watcher authenticates against the provider
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password { login: String, password: String },
    OAuth { login: Option<String>, refresh_token: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password { login, .. } => f
                .debug_struct("Password")
                .field("login", login)
                .field("password", &"<redacted>")
                .finish(),
            Credential::OAuth { login, .. } => f
                .debug_struct("OAuth")
                .field("login", login)
                .field("refresh_token", &"<redacted>")
                .finish(),
        }
    }
}

/// Resolved connection settings, refetched before every connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub account_id: AccountId,
    pub kind: ProviderKind,
    pub host: Option<String>,
    pub port: u16,
    pub use_tls: bool,
    pub credential: Credential,
}

/// Cached message row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CachedMessage {
    pub account_id: AccountId,
    pub folder: String,
    pub uid: String,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub seen: Option<bool>,
    pub starred: Option<bool>,
    pub removed: bool,
}

impl From<CachedMessage> for MessageMeta {
    fn from(row: CachedMessage) -> Self {
        MessageMeta {
            uid: row.uid,
            folder: Some(row.folder),
            subject: row.subject,
            from: row.from_addr,
            to: row.to_addr,
            date: row.date,
            message_id: row.message_id,
            flags: FlagState {
                seen: row.seen,
                starred: row.starred,
            },
            ..Default::default()
        }
    }
}

/// One message destined for the shared bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Fully qualified channel, `"<database>, account.<id>"`
    pub channel: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn account(kind: &str) -> MailAccount {
        MailAccount {
            id: 5,
            name: "ops".into(),
            server_kind: kind.into(),
            host: Some("imap.example.com".into()),
            port: None,
            use_tls: true,
            login: Some("ops@example.com".into()),
            password: Some("secret".into()),
            oauth_refresh_token: None,
            gmail_last_history_id: None,
            outlook_delta_tokens: serde_json::json!({"inbox-id": "https://graph/delta?token=1"}),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_imap_config_defaults_port() {
        let config = account("imap").to_config().unwrap();
        assert_eq!(config.kind, ProviderKind::Imap);
        assert_eq!(config.port, DEFAULT_IMAP_PORT);
        assert_eq!(config.host.as_deref(), Some("imap.example.com"));
    }

    #[test]
    fn test_missing_host_is_configuration_error() {
        let mut acc = account("imap");
        acc.host = Some("  ".into());
        let err = acc.to_config().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_gmail_requires_refresh_token() {
        let mut acc = account("gmail");
        assert!(matches!(acc.to_config(), Err(Error::Configuration(_))));

        acc.oauth_refresh_token = Some("1//refresh".into());
        let config = acc.to_config().unwrap();
        assert_eq!(config.kind, ProviderKind::Gmail);
        assert!(format!("{:?}", config.credential).contains("<redacted>"));
    }

    #[test]
    fn test_delta_tokens() {
        let tokens = account("outlook").delta_tokens();
        assert_eq!(tokens.get("inbox-id").map(String::as_str), Some("https://graph/delta?token=1"));
    }
}
