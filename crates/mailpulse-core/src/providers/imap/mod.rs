//! Push-capable IMAP provider

pub mod client;
pub mod response;

pub use client::{ImapClient, ImapConnector};
pub use response::{compact_sequence_set, Capabilities, FetchedFlags, MailboxStatus, Untagged};

use async_trait::async_trait;
use mailpulse_common::{Error, Result};
use mailpulse_storage::models::AccountConfig;
use std::time::Duration;

/// Outcome of one bounded IDLE wait slice
#[derive(Debug)]
pub enum IdleWait {
    /// The server pushed one or more untagged responses
    Notified(Vec<Untagged>),
    /// Nothing arrived within the slice
    TimedOut,
    /// The connection or the IDLE command broke
    Failed(Error),
}

/// An authenticated IMAP session.
///
/// Capabilities are negotiated once during connect and cached for the
/// lifetime of the session.
#[async_trait]
pub trait PushSession: Send {
    fn capabilities(&self) -> &Capabilities;

    /// Hierarchy delimiter reported by `LIST "" ""`
    fn delimiter(&self) -> Option<char>;

    async fn enable_utf8(&mut self) -> Result<()>;
    async fn select(&mut self, mailbox: &str) -> Result<()>;
    async fn examine(&mut self, mailbox: &str) -> Result<()>;
    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus>;
    async fn idle_start(&mut self) -> Result<()>;
    async fn idle_wait(&mut self, slice: Duration) -> IdleWait;
    async fn idle_done(&mut self) -> Result<()>;
    async fn fetch_flags(&mut self, sequence_set: &str) -> Result<Vec<FetchedFlags>>;
    async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>>;
    async fn noop(&mut self) -> Result<Vec<Untagged>>;
    async fn logout(&mut self) -> Result<()>;
}

/// Opens authenticated sessions
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn PushSession>>;
}
