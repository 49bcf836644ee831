//! MailPulse Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy and the change
//! event model shared across all MailPulse components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
