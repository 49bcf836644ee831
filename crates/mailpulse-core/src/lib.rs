//! MailPulse Core - mailbox change watchers and event publishing
//!
//! This crate provides the provider clients (IMAP, Gmail, Microsoft Graph),
//! the per-provider sync strategies, the supervised account watcher, the
//! subscription manager with leader election and heartbeat GC, and the
//! batching event publisher.

pub mod backoff;
pub mod manager;
pub mod metrics;
pub mod providers;
pub mod publisher;
pub mod registry;
pub mod runtime;
pub mod strategy;
pub mod watcher;

pub use manager::{ManagerStatus, SubscriptionManager, SubscriptionReply};
pub use metrics::{metrics, Metrics};
pub use publisher::{coalesce, Envelope, EventPublisher, PublisherDeps};
pub use registry::{ManagerFactory, ManagerRegistry, PgManagerFactory};
pub use strategy::{
    CycleOutcome, DefaultStrategyFactory, EventSink, StrategyFactory, SyncStrategy, WatcherContext,
};
pub use watcher::{AccountWatcher, WatcherDeps, WatcherListener, WatcherPhase};
