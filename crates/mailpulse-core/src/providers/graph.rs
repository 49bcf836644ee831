//! Microsoft Graph mail client
//!
//! Delta queries per folder (or over the whole mailbox), folder lookups and
//! message metadata.

use super::http::RestClient;
use super::oauth::TokenSource;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use mailpulse_common::config::{OutlookConfig, GLOBAL_FOLDER};
use mailpulse_common::types::{FlagState, MessageMeta};
use mailpulse_common::{Error, Result};
use mailpulse_storage::models::{AccountConfig, Credential};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Fields requested on every delta and message query
pub const MESSAGE_SELECT: &str = "id,subject,from,toRecipients,receivedDateTime,hasAttachments,internetMessageId,parentFolderId,isRead,flag";

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default offline_access";

/// Graph well-known folder name for a configured folder
pub fn well_known_folder(name: &str) -> Option<&'static str> {
    match name.to_ascii_uppercase().as_str() {
        "INBOX" => Some("inbox"),
        "SENT" => Some("sentitems"),
        "DRAFTS" => Some("drafts"),
        "DELETED" | "TRASH" => Some("deleteditems"),
        "ARCHIVE" => Some("archive"),
        "JUNK" | "SPAM" => Some("junkemail"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: Option<EmailAddress>,
}

impl Recipient {
    fn display(&self) -> Option<String> {
        let email = self.email_address.as_ref()?;
        match (&email.name, &email.address) {
            (Some(name), Some(address)) if !name.is_empty() => Some(format!("{} <{}>", name, address)),
            (_, Some(address)) => Some(address.clone()),
            (Some(name), None) => Some(name.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupFlag {
    #[serde(alias = "status")]
    pub flag_status: Option<String>,
}

/// Message as returned by delta queries and `GET /me/messages/{id}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub id: String,
    #[serde(rename = "@removed")]
    pub removed: Option<serde_json::Value>,
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    pub received_date_time: Option<String>,
    pub has_attachments: Option<bool>,
    pub internet_message_id: Option<String>,
    pub parent_folder_id: Option<String>,
    pub is_read: Option<bool>,
    pub flag: Option<FollowupFlag>,
}

impl GraphMessage {
    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    pub fn flags(&self) -> FlagState {
        FlagState {
            seen: self.is_read,
            starred: self
                .flag
                .as_ref()
                .and_then(|f| f.flag_status.as_deref())
                .map(|s| s.eq_ignore_ascii_case("flagged")),
        }
    }

    /// Delta updates may only carry the changed properties
    pub fn has_display_fields(&self) -> bool {
        self.subject.is_some() && self.received_date_time.is_some()
    }

    pub fn to_meta(&self, folder: Option<String>) -> MessageMeta {
        let to: Vec<String> = self.to_recipients.iter().filter_map(Recipient::display).collect();
        MessageMeta {
            uid: self.id.clone(),
            folder,
            subject: self.subject.clone(),
            from: self.from.as_ref().and_then(Recipient::display),
            to: if to.is_empty() { None } else { Some(to.join(", ")) },
            date: self.received_date_time.clone(),
            message_id: self.internet_message_id.clone(),
            has_attachments: self.has_attachments,
            flags: self.flags(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaPage {
    #[serde(default)]
    pub value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolder {
    id: String,
    display_name: Option<String>,
}

/// Graph operations used by the delta strategy
#[async_trait]
pub trait GraphApi: Send {
    /// Resolve a well-known folder name (`inbox`, `sentitems`, ...) to its id
    async fn folder_id(&mut self, well_known: &str) -> Result<String>;

    /// Display name of a folder id
    async fn folder_name(&mut self, folder_id: &str) -> Result<Option<String>>;

    /// One delta page. `link` is a stored next/delta link; without one the
    /// initial query for `folder_id` (or the whole mailbox) is issued.
    async fn delta_page(&mut self, folder_id: Option<&str>, link: Option<&str>) -> Result<DeltaPage>;

    /// Full messages for ids whose delta entry lacked display fields
    async fn messages(&mut self, ids: &[String]) -> Result<Vec<GraphMessage>>;

    /// Drop cached credentials so the next call re-authenticates
    fn reauthenticate(&mut self);
}

/// Graph REST client for one account
pub struct GraphClient {
    http: RestClient,
    tokens: TokenSource,
    api_base: String,
    page_size: u32,
    initial_days: i64,
}

impl GraphClient {
    pub fn new(config: &OutlookConfig, account: &AccountConfig) -> Result<Self> {
        let Credential::OAuth { refresh_token, .. } = &account.credential else {
            return Err(Error::Configuration(format!(
                "account {} has no OAuth credential",
                account.account_id
            )));
        };

        let http = RestClient::new(
            Duration::from_secs(config.request_timeout_secs),
            config.max_rate_limit_retries,
        )?;
        let tokens = TokenSource::new(
            http.inner().clone(),
            config.token_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            refresh_token.clone(),
        )
        .with_scope(GRAPH_SCOPE);

        Ok(Self {
            http,
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            initial_days: config.initial_days,
        })
    }

    fn prefer_header(&self) -> [(&'static str, String); 1] {
        [("Prefer", format!("odata.maxpagesize={}", self.page_size))]
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn folder_id(&mut self, well_known: &str) -> Result<String> {
        let bearer = self.tokens.bearer().await?;
        let url = format!("{}/me/mailFolders/{}", self.api_base, well_known);
        let folder: MailFolder = self
            .http
            .get_json(&url, &[("$select", "id,displayName".to_string())], &bearer, &[])
            .await?;
        Ok(folder.id)
    }

    async fn folder_name(&mut self, folder_id: &str) -> Result<Option<String>> {
        let bearer = self.tokens.bearer().await?;
        let url = format!("{}/me/mailFolders/{}", self.api_base, folder_id);
        match self
            .http
            .get_json::<MailFolder>(&url, &[("$select", "displayName".to_string())], &bearer, &[])
            .await
        {
            Ok(folder) => Ok(folder.display_name),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delta_page(&mut self, folder_id: Option<&str>, link: Option<&str>) -> Result<DeltaPage> {
        let bearer = self.tokens.bearer().await?;
        let headers = self.prefer_header();

        if let Some(link) = link {
            return self.http.get_json(link, &[], &bearer, &headers).await;
        }

        let url = match folder_id.filter(|f| *f != GLOBAL_FOLDER) {
            Some(folder) => format!("{}/me/mailFolders/{}/messages/delta", self.api_base, folder),
            None => format!("{}/me/messages/delta", self.api_base),
        };
        let since = (Utc::now() - ChronoDuration::days(self.initial_days))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let query = [
            ("$select", MESSAGE_SELECT.to_string()),
            ("$filter", format!("receivedDateTime ge {}", since)),
        ];
        self.http.get_json(&url, &query, &bearer, &headers).await
    }

    async fn messages(&mut self, ids: &[String]) -> Result<Vec<GraphMessage>> {
        let bearer = self.tokens.bearer().await?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let url = format!("{}/me/messages/{}", self.api_base, id);
            match self
                .http
                .get_json::<GraphMessage>(&url, &[("$select", MESSAGE_SELECT.to_string())], &bearer, &[])
                .await
            {
                Ok(message) => messages.push(message),
                Err(Error::NotFound(_)) => {}
                Err(e @ Error::AuthExpired(_)) => return Err(e),
                Err(e) => warn!("Fetching message {} failed: {}", id, e),
            }
        }
        Ok(messages)
    }

    fn reauthenticate(&mut self) {
        self.tokens.invalidate();
    }
}
