//! Gmail REST client
//!
//! Wraps the three calls the history-cursor strategy needs: `history.list`,
//! the mailbox head lookup used to (re)initialise the anchor, and metadata
//! fetches for added or moved messages.

use super::http::RestClient;
use super::oauth::TokenSource;
use async_trait::async_trait;
use mailpulse_common::config::GmailConfig;
use mailpulse_common::types::{FlagState, MessageMeta};
use mailpulse_common::{Error, Result};
use mailpulse_storage::models::{AccountConfig, Credential};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const LABEL_INBOX: &str = "INBOX";
pub const LABEL_SENT: &str = "SENT";
pub const LABEL_TRASH: &str = "TRASH";
pub const LABEL_SPAM: &str = "SPAM";
pub const LABEL_UNREAD: &str = "UNREAD";
pub const LABEL_STARRED: &str = "STARRED";

/// Pseudo folder for archived mail (no INBOX label)
pub const FOLDER_ALL: &str = "ALL";

/// Folder a message belongs to, by label priority TRASH > SPAM > SENT > INBOX > ALL
pub fn primary_folder<S: AsRef<str>>(labels: &[S]) -> &'static str {
    let has = |name: &str| labels.iter().any(|l| l.as_ref() == name);
    if has(LABEL_TRASH) {
        LABEL_TRASH
    } else if has(LABEL_SPAM) {
        LABEL_SPAM
    } else if has(LABEL_SENT) {
        LABEL_SENT
    } else if has(LABEL_INBOX) {
        LABEL_INBOX
    } else {
        FOLDER_ALL
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEntry {
    pub message: MessageRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelEntry {
    pub message: MessageRef,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

/// One `history.list` record
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub messages_added: Vec<MessageEntry>,
    #[serde(default)]
    pub messages_deleted: Vec<MessageEntry>,
    #[serde(default)]
    pub labels_added: Vec<LabelEntry>,
    #[serde(default)]
    pub labels_removed: Vec<LabelEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    history_id: Option<String>,
    #[serde(default)]
    payload: Payload,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<String> {
        self.payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    fn into_meta(self) -> MessageMeta {
        let seen = !self.label_ids.iter().any(|l| l == LABEL_UNREAD);
        let starred = self.label_ids.iter().any(|l| l == LABEL_STARRED);
        MessageMeta {
            folder: Some(primary_folder(&self.label_ids).to_string()),
            subject: self.header("Subject"),
            from: self.header("From"),
            to: self.header("To"),
            date: self.header("Date"),
            message_id: self.header("Message-ID"),
            thread_id: self.thread_id.clone(),
            snippet: self.snippet.clone(),
            flags: FlagState::new(seen, starred),
            uid: self.id,
            ..Default::default()
        }
    }
}

/// Gmail operations used by the history strategy
#[async_trait]
pub trait GmailApi: Send {
    /// One page of history after `start_history_id`
    async fn history_page(
        &mut self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage>;

    /// History id of the newest message outside spam and trash
    async fn head_history_id(&mut self) -> Result<Option<String>>;

    /// Metadata for the given message ids; ids that no longer exist are skipped
    async fn messages_meta(&mut self, ids: &[String]) -> Result<Vec<MessageMeta>>;

    /// Drop cached credentials so the next call re-authenticates
    fn reauthenticate(&mut self);
}

/// Gmail REST client for one account
pub struct GmailClient {
    http: RestClient,
    tokens: TokenSource,
    api_base: String,
    page_size: u32,
    meta_batch_size: usize,
}

impl GmailClient {
    pub fn new(config: &GmailConfig, account: &AccountConfig) -> Result<Self> {
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
        );

        Ok(Self {
            http,
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            page_size: config.history_page_size,
            meta_batch_size: config.meta_batch_size.max(1),
        })
    }

    async fn get_message(
        http: RestClient,
        url: String,
        bearer: String,
    ) -> Result<Option<GmailMessage>> {
        let query = [
            ("format", "metadata".to_string()),
            ("metadataHeaders", "Subject".to_string()),
            ("metadataHeaders", "From".to_string()),
            ("metadataHeaders", "To".to_string()),
            ("metadataHeaders", "Date".to_string()),
            ("metadataHeaders", "Message-ID".to_string()),
        ];
        match http.get_json::<GmailMessage>(&url, &query, &bearer, &[]).await {
            Ok(message) => Ok(Some(message)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl GmailApi for GmailClient {
    async fn history_page(
        &mut self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage> {
        let bearer = self.tokens.bearer().await?;
        let mut query = vec![
            ("startHistoryId", start_history_id.to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let url = format!("{}/history", self.api_base);
        match self.http.get_json::<HistoryPage>(&url, &query, &bearer, &[]).await {
            Ok(page) => Ok(page),
            // A history id older than the retention window is answered with 404
            Err(Error::NotFound(msg)) => Err(Error::AnchorInvalid(msg)),
            Err(Error::TransientProtocol(msg)) if msg.to_ascii_lowercase().contains("historyid") => {
                Err(Error::AnchorInvalid(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn head_history_id(&mut self) -> Result<Option<String>> {
        let bearer = self.tokens.bearer().await?;
        let url = format!("{}/messages", self.api_base);
        let query = [
            ("maxResults", "1".to_string()),
            ("q", "-in:spam -in:trash".to_string()),
        ];
        let list: MessageList = self.http.get_json(&url, &query, &bearer, &[]).await?;

        let Some(head) = list.messages.first() else {
            return Ok(None);
        };
        let url = format!("{}/messages/{}", self.api_base, head.id);
        let message = Self::get_message(self.http.clone(), url, bearer).await?;
        Ok(message.and_then(|m| m.history_id))
    }

    async fn messages_meta(&mut self, ids: &[String]) -> Result<Vec<MessageMeta>> {
        let bearer = self.tokens.bearer().await?;
        let mut metas = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(self.meta_batch_size) {
            let mut set = JoinSet::new();
            for (index, id) in chunk.iter().enumerate() {
                let url = format!("{}/messages/{}", self.api_base, id);
                let http = self.http.clone();
                let bearer = bearer.clone();
                set.spawn(async move { (index, Self::get_message(http, url, bearer).await) });
            }

            let mut batch = Vec::with_capacity(chunk.len());
            while let Some(joined) = set.join_next().await {
                let (index, result) =
                    joined.map_err(|e| Error::Internal(format!("metadata task failed: {}", e)))?;
                match result {
                    Ok(Some(message)) => batch.push((index, message.into_meta())),
                    Ok(None) => debug!("Message {} vanished before metadata fetch", chunk[index]),
                    Err(e @ Error::AuthExpired(_)) => return Err(e),
                    Err(e) => warn!("Metadata fetch for {} failed: {}", chunk[index], e),
                }
            }
            batch.sort_by_key(|(index, _)| *index);
            metas.extend(batch.into_iter().map(|(_, meta)| meta));
        }

        Ok(metas)
    }

    fn reauthenticate(&mut self) {
        self.tokens.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailpulse_common::types::ProviderKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> GmailClient {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.test",
                "expires_in": 3600
            })))
            .mount(server)
            .await;

        let config = GmailConfig {
            api_base: format!("{}/gmail/v1/users/me", server.uri()),
            token_url: format!("{}/token", server.uri()),
            ..Default::default()
        };
        let account = AccountConfig {
            account_id: 1,
            kind: ProviderKind::Gmail,
            host: None,
            port: 993,
            use_tls: true,
            credential: Credential::OAuth {
                login: Some("me@gmail.com".into()),
                refresh_token: "1//refresh".into(),
            },
        };
        GmailClient::new(&config, &account).unwrap()
    }

    #[test]
    fn test_primary_folder_priority() {
        assert_eq!(primary_folder(&["INBOX", "TRASH"]), "TRASH");
        assert_eq!(primary_folder(&["SPAM", "SENT"]), "SPAM");
        assert_eq!(primary_folder(&["SENT", "INBOX"]), "SENT");
        assert_eq!(primary_folder(&["INBOX", "UNREAD"]), "INBOX");
        assert_eq!(primary_folder::<&str>(&[]), "ALL");
    }

    #[tokio::test]
    async fn test_history_page_decodes_records() {
        let server = MockServer::start().await;
        let mut client = client_for(&server).await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "1000"))
            .and(query_param("maxResults", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {"id": "1001", "messagesAdded": [{"message": {"id": "m1", "labelIds": ["INBOX", "UNREAD"]}}]},
                    {"id": "1002", "labelsRemoved": [{"message": {"id": "m2"}, "labelIds": ["INBOX"]}]}
                ],
                "nextPageToken": "p2",
                "historyId": "1002"
            })))
            .mount(&server)
            .await;

        let page = client.history_page("1000", None).await.unwrap();
        assert_eq!(page.history.len(), 2);
        assert_eq!(page.history[0].messages_added[0].message.id, "m1");
        assert_eq!(page.history[1].labels_removed[0].label_ids, vec!["INBOX".to_string()]);
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_expired_history_id_is_anchor_invalid() {
        let server = MockServer::start().await;
        let mut client = client_for(&server).await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "Requested entity was not found."}
            })))
            .mount(&server)
            .await;

        let err = client.history_page("1", None).await.unwrap_err();
        assert!(matches!(err, Error::AnchorInvalid(_)));
    }

    #[tokio::test]
    async fn test_head_history_id() {
        let server = MockServer::start().await;
        let mut client = client_for(&server).await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "-in:spam -in:trash"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "newest", "threadId": "t"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/newest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "newest", "historyId": "98765", "labelIds": ["INBOX"]
            })))
            .mount(&server)
            .await;

        assert_eq!(client.head_history_id().await.unwrap().as_deref(), Some("98765"));
    }

    #[tokio::test]
    async fn test_messages_meta_skips_vanished_messages() {
        let server = MockServer::start().await;
        let mut client = client_for(&server).await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "a",
                "threadId": "ta",
                "labelIds": ["INBOX", "STARRED"],
                "snippet": "hello",
                "payload": {"headers": [
                    {"name": "Subject", "value": "Quarterly report"},
                    {"name": "From", "value": "Ann <ann@example.com>"}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let metas = client
            .messages_meta(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].uid, "a");
        assert_eq!(metas[0].subject.as_deref(), Some("Quarterly report"));
        assert_eq!(metas[0].folder.as_deref(), Some("INBOX"));
        assert_eq!(metas[0].flags, FlagState::new(true, true));
    }
}
