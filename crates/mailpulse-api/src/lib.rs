//! MailPulse API - control-plane REST server
//!
//! This crate provides the thin HTTP surface clients use to subscribe to
//! account changes, send heartbeats and read the watcher status.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
