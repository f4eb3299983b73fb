//! Configuration and settings management
//!
//! Loads settings from layered config files and environment variables and
//! defines the tuning constants for retries, polling and session expiry.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Callback token shared with the messaging platform (signature input)
    pub callback_token: String,
    /// 43-character message encryption key from the platform console
    pub encoding_aes_key: String,
    /// Enterprise id; doubles as the target id bound into the envelope
    pub corp_id: String,
    /// Application id inside the enterprise account
    pub agent_id: String,
    /// Application secret (used to obtain push access tokens)
    pub corp_secret: String,

    /// HTTP listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the platform API (override for relay/proxy setups)
    #[serde(default = "default_platform_api_base")]
    pub platform_api_base: String,
    /// Base URL of the drive API
    #[serde(default = "default_drive_api_base")]
    pub drive_api_base: String,
    /// Base URL of the drive account endpoints
    #[serde(default = "default_drive_account_base")]
    pub drive_account_base: String,

    /// Folder id that transfers are saved into ("0" is the drive root)
    #[serde(default = "default_folder_id")]
    pub default_folder_id: String,
    /// Folder id that searches are scoped to
    #[serde(default = "default_folder_id")]
    pub search_folder_id: String,

    /// Directory holding persisted state (the credential file)
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Seconds of inactivity before a sender's dialogue mode resets
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Seconds a processed message id is remembered for duplicate suppression
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Maximum number of remembered message ids
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: u64,

    /// Per-attempt timeout for drive and platform HTTP calls
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Retries after a transient drive failure (auth errors are never retried)
    #[serde(default = "default_provider_retries")]
    pub provider_retries: usize,
    /// Seconds the webhook handler waits before degrading to a deferred reply
    #[serde(default = "default_reply_deadline_secs")]
    pub reply_deadline_secs: u64,
    /// Maximum number of search hits rendered in one reply
    #[serde(default = "default_search_display_limit")]
    pub search_display_limit: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8888
}

fn default_platform_api_base() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

fn default_drive_api_base() -> String {
    "https://drive-pc.quark.cn".to_string()
}

fn default_drive_account_base() -> String {
    "https://pan.quark.cn".to_string()
}

fn default_folder_id() -> String {
    "0".to_string()
}

fn default_state_dir() -> String {
    "./state".to_string()
}

const fn default_session_timeout_secs() -> u64 {
    60
}

const fn default_dedup_ttl_secs() -> u64 {
    600
}

const fn default_dedup_capacity() -> u64 {
    10_000
}

const fn default_provider_timeout_secs() -> u64 {
    20
}

const fn default_provider_retries() -> usize {
    2
}

const fn default_reply_deadline_secs() -> u64 {
    4
}

const fn default_search_display_limit() -> usize {
    10
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading or deserialization fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Environment::default() maps UPPER_SNAKE_CASE to snake_case;
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Path of the persisted credential file
    #[must_use]
    pub fn credential_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir).join("credential.txt")
    }
}

/// Initial backoff before retrying a transient drive failure
pub const PROVIDER_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling for transient drive retries
pub const PROVIDER_MAX_BACKOFF_MS: u64 = 4000;

/// Polls of an accepted drive task before giving up
pub const TASK_POLL_ATTEMPTS: usize = 12;
/// Delay between drive task polls
pub const TASK_POLL_INTERVAL_MS: u64 = 500;

/// Maximum folder nesting explored by a search
pub const SEARCH_MAX_DEPTH: usize = 4;
/// Maximum number of folders listed by one search
pub const SEARCH_MAX_DIRS: usize = 50;
/// Page size requested from the drive listing endpoint
pub const SEARCH_PAGE_SIZE: usize = 200;

/// Seconds subtracted from a push token's lifetime before refresh
pub const PUSH_TOKEN_REFRESH_MARGIN_SECS: u64 = 300;
