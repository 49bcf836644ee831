//! MailPulse Storage - Database access for the watcher engine
//!
//! This crate provides the Postgres pool, migrations, the repositories the
//! watchers read and write (accounts, anchors, message cache, bus) and the
//! leader lease.

pub mod db;
pub mod lease;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use lease::{LeaderLease, LocalLease, PgAdvisoryLease};
pub use models::*;
pub use repository::*;
