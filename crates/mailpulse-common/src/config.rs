//! Configuration for MailPulse

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Control-plane API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Watcher, heartbeat and GC timing
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Event publisher batching
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Gmail REST provider
    #[serde(default)]
    pub gmail: GmailConfig,

    /// Microsoft Graph provider
    #[serde(default)]
    pub outlook: OutlookConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Database identity used for the leader lease and bus channels.
    /// Derived from the URL path when unset.
    pub name: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            name: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Database identity: explicit `name`, else the last path segment of the URL
    pub fn database_name(&self) -> String {
        if let Some(name) = self.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        let without_query = self.url.split('?').next().unwrap_or_default();
        match without_query.rsplit_once('/') {
            Some((prefix, db)) if !db.is_empty() && !prefix.ends_with('/') => db.to_string(),
            _ => "postgres".to_string(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/mailpulse".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,mailpulse=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_api_bind")]
    pub bind: String,

    /// Listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            port: default_api_port(),
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8090
}

/// Watcher lifecycle and protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Subscriptions without a heartbeat for this long are dropped
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,

    /// Heartbeat GC period
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// First retry delay after a failed cycle
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Maximum random jitter added to each retry delay
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// How long `stop()` waits for protocol teardown
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Pause after a poll cycle that found nothing
    #[serde(default = "default_quiet_interval")]
    pub quiet_interval_secs: u64,

    /// Pause after a poll cycle that produced changes
    #[serde(default = "default_active_interval")]
    pub active_interval_secs: u64,

    /// Length of a single IDLE wait slice
    #[serde(default = "default_idle_wait_slice")]
    pub idle_wait_slice_secs: u64,

    /// IDLE is renewed with DONE + NOOP after this long
    #[serde(default = "default_idle_keepalive")]
    pub idle_keepalive_secs: u64,

    /// Poll period for servers without IDLE
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// TCP/TLS connect and command timeout for IMAP
    #[serde(default = "default_imap_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: default_heartbeat_ttl(),
            gc_interval_secs: default_gc_interval(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            jitter_ms: default_jitter_ms(),
            stop_grace_secs: default_stop_grace(),
            quiet_interval_secs: default_quiet_interval(),
            active_interval_secs: default_active_interval(),
            idle_wait_slice_secs: default_idle_wait_slice(),
            idle_keepalive_secs: default_idle_keepalive(),
            poll_interval_secs: default_poll_interval(),
            connect_timeout_secs: default_imap_timeout(),
        }
    }
}

impl WatcherConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_secs(self.quiet_interval_secs)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn idle_wait_slice(&self) -> Duration {
        Duration::from_secs(self.idle_wait_slice_secs)
    }

    pub fn idle_keepalive(&self) -> Duration {
        Duration::from_secs(self.idle_keepalive_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_heartbeat_ttl() -> u64 {
    60
}

fn default_gc_interval() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    30
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_stop_grace() -> u64 {
    3
}

fn default_quiet_interval() -> u64 {
    30
}

fn default_active_interval() -> u64 {
    5
}

fn default_idle_wait_slice() -> u64 {
    5
}

fn default_idle_keepalive() -> u64 {
    25 * 60
}

fn default_poll_interval() -> u64 {
    10
}

fn default_imap_timeout() -> u64 {
    30
}

/// Event publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Bounded queue size before events degrade to refreshes
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a batch collects events after the first one arrives
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Maximum events per flush
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_window_ms: default_batch_window_ms(),
            max_batch: default_max_batch(),
        }
    }
}

impl PublisherConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

fn default_queue_capacity() -> usize {
    2000
}

fn default_batch_window_ms() -> u64 {
    50
}

fn default_max_batch() -> usize {
    200
}

/// Gmail API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    /// API base including the user path
    #[serde(default = "default_gmail_api_base")]
    pub api_base: String,

    /// OAuth token endpoint
    #[serde(default = "default_google_token_url")]
    pub token_url: String,

    /// OAuth client id
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// `maxResults` for history.list
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    /// Messages per metadata batch
    #[serde(default = "default_meta_batch_size")]
    pub meta_batch_size: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries on HTTP 429
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: default_gmail_api_base(),
            token_url: default_google_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            history_page_size: default_history_page_size(),
            meta_batch_size: default_meta_batch_size(),
            request_timeout_secs: default_request_timeout(),
            max_rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1/users/me".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_history_page_size() -> u32 {
    500
}

fn default_meta_batch_size() -> usize {
    50
}

fn default_request_timeout() -> u64 {
    60
}

fn default_rate_limit_retries() -> u32 {
    5
}

/// Folder key meaning "one cursor over the whole mailbox"
pub const GLOBAL_FOLDER: &str = "__ALL__";

/// Microsoft Graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlookConfig {
    /// Graph API base
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,

    /// OAuth token endpoint
    #[serde(default = "default_microsoft_token_url")]
    pub token_url: String,

    /// OAuth client id
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// Tracked folders (INBOX, SENT, DELETED, JUNK, ARCHIVE, DRAFTS or `__ALL__`)
    #[serde(default = "default_outlook_folders")]
    pub folders: Vec<String>,

    /// `odata.maxpagesize`
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// First sync only looks this many days back
    #[serde(default = "default_initial_days")]
    pub initial_days: i64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries on HTTP 429
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
}

impl Default for OutlookConfig {
    fn default() -> Self {
        Self {
            api_base: default_graph_api_base(),
            token_url: default_microsoft_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            folders: default_outlook_folders(),
            page_size: default_page_size(),
            initial_days: default_initial_days(),
            request_timeout_secs: default_request_timeout(),
            max_rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

fn default_graph_api_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_microsoft_token_url() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}

fn default_outlook_folders() -> Vec<String> {
    ["INBOX", "SENT", "DELETED", "JUNK", "ARCHIVE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_page_size() -> u32 {
    100
}

fn default_initial_days() -> i64 {
    30
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the first config file found, overlaid with
    /// `MAILPULSE__SECTION__KEY` environment variables
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var("MAILPULSE_CONFIG").ok().map(PathBuf::from);
        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailpulse/config.toml"),
        ];
        let file = explicit.or_else(|| paths.into_iter().find(|p| p.exists()));

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MAILPULSE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("outlook.folders"),
        );

        let settings = builder
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let watcher = WatcherConfig::default();
        assert_eq!(watcher.heartbeat_ttl(), Duration::from_secs(60));
        assert_eq!(watcher.gc_interval(), Duration::from_secs(10));
        assert_eq!(watcher.idle_keepalive(), Duration::from_secs(1500));

        let publisher = PublisherConfig::default();
        assert_eq!(publisher.queue_capacity, 2000);
        assert_eq!(publisher.batch_window(), Duration::from_millis(50));
        assert_eq!(publisher.max_batch, 200);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://db.internal:5432/crm?sslmode=require"

[watcher]
heartbeat_ttl_secs = 90

[outlook]
folders = ["__ALL__"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.database_name(), "crm");
        assert_eq!(config.watcher.heartbeat_ttl_secs, 90);
        assert_eq!(config.watcher.gc_interval_secs, 10);
        assert_eq!(config.outlook.folders, vec![GLOBAL_FOLDER.to_string()]);
        assert_eq!(config.gmail.meta_batch_size, 50);
    }

    #[test]
    fn test_database_name_override() {
        let db = DatabaseConfig {
            name: Some("tenant_a".into()),
            ..Default::default()
        };
        assert_eq!(db.database_name(), "tenant_a");
        assert_eq!(DatabaseConfig::default().database_name(), "mailpulse");
    }
}
