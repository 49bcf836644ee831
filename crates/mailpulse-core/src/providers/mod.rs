//! Provider clients
//!
//! One client per backend kind. The strategies only talk to the traits
//! ([`imap::PushSession`], [`gmail::GmailApi`], [`graph::GraphApi`]) so tests
//! can substitute scripted providers.

pub mod gmail;
pub mod graph;
pub mod http;
pub mod imap;
pub mod oauth;

pub use gmail::{GmailApi, GmailClient};
pub use graph::{GraphApi, GraphClient};
pub use http::RestClient;
pub use imap::{IdleWait, ImapClient, ImapConnector, PushConnector, PushSession};
pub use oauth::TokenSource;
