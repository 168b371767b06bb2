//! # Bridge Configuration
//!
//! Configuration for the cloud client, poller and thumbnail cache.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FORMLINK_CLIENT_ID=...                                             │
//! │     FORMLINK_POLL_INTERVAL_SECS=20                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/formlink/bridge.toml (Linux)                             │
//! │     ~/Library/Application Support/io.formlink.formlink/bridge.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     30s poll interval, stale after 3 failures, thumbnails enabled      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # bridge.toml
//! [auth]
//! client_id = "abc"
//! client_secret = "def"
//! # refresh_token is written back here after every rotation
//!
//! [api]
//! base_url = "https://api.formlabs.com/developer/v1"
//! request_timeout_secs = 25
//!
//! [polling]
//! interval_secs = 30
//! stale_after_failures = 3
//! printers = ["Form4-Bright-Otter"]  # optional allow-list
//!
//! [thumbnails]
//! enabled = true
//! max_entries = 16
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use formlink_core::{Normalizer, StalenessPolicy};

use crate::error::{CloudError, CloudResult};

/// Allowed range for the poll interval override.
pub const MIN_POLL_INTERVAL_SECS: u64 = 15;
pub const MAX_POLL_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Auth Settings
// =============================================================================

/// OAuth client credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Last refresh token issued by the vendor. Rotated on every refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// API Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the developer API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth2 token endpoint.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Timeout for API requests (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for token requests (seconds).
    #[serde(default = "default_token_timeout")]
    pub token_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.formlabs.com/developer/v1".to_string()
}

fn default_token_url() -> String {
    "https://api.formlabs.com/developer/v1/o/token/".to_string()
}

fn default_request_timeout() -> u64 {
    25
}

fn default_token_timeout() -> u64 {
    20
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: default_base_url(),
            token_url: default_token_url(),
            request_timeout_secs: default_request_timeout(),
            token_timeout_secs: default_token_timeout(),
        }
    }
}

// =============================================================================
// Polling Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Interval between reconciliation passes (seconds).
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Consecutive failed polls before a printer is marked stale.
    #[serde(default = "default_stale_after_failures")]
    pub stale_after_failures: u32,

    /// Printers to poll. `None` polls everything the account lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printers: Option<Vec<String>>,

    /// A printer counts as online when it pinged within this window (seconds).
    #[serde(default = "default_online_max_age")]
    pub online_max_age_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stale_after_failures() -> u32 {
    3
}

fn default_online_max_age() -> u64 {
    600
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            interval_secs: default_poll_interval(),
            stale_after_failures: default_stale_after_failures(),
            printers: None,
            online_max_age_secs: default_online_max_age(),
        }
    }
}

// =============================================================================
// Thumbnail Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailSettings {
    /// Enables the thumbnail camera.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache cap; least recently used entries go first.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Lifetime assumed for signed URLs without an expiry (seconds).
    #[serde(default = "default_thumbnail_ttl")]
    pub default_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    16
}

fn default_thumbnail_ttl() -> u64 {
    3600
}

impl Default for ThumbnailSettings {
    fn default() -> Self {
        ThumbnailSettings {
            enabled: true,
            max_entries: default_max_entries(),
            default_ttl_secs: default_thumbnail_ttl(),
        }
    }
}

// =============================================================================
// Main Bridge Configuration
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub thumbnails: ThumbnailSettings,
}

impl BridgeConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (bridge.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> CloudResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading bridge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> CloudResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| CloudError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CloudError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| CloudError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Bridge config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CloudResult<()> {
        if self.auth.client_id.trim().is_empty() {
            return Err(CloudError::InvalidConfig("auth.client_id is required".into()));
        }

        if self.auth.client_secret.is_empty() && self.auth.refresh_token.is_none() {
            return Err(CloudError::InvalidConfig(
                "auth.client_secret or auth.refresh_token is required".into(),
            ));
        }

        parse_http_url("api.base_url", &self.api.base_url)?;
        parse_http_url("api.token_url", &self.api.token_url)?;

        if self.api.request_timeout_secs == 0 || self.api.token_timeout_secs == 0 {
            return Err(CloudError::InvalidConfig("timeouts must be greater than 0".into()));
        }

        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&self.polling.interval_secs) {
            return Err(CloudError::InvalidConfig(format!(
                "polling.interval_secs must be between {} and {}, got {}",
                MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS, self.polling.interval_secs
            )));
        }

        if self.polling.stale_after_failures == 0 {
            return Err(CloudError::InvalidConfig(
                "polling.stale_after_failures must be at least 1".into(),
            ));
        }

        if self.thumbnails.max_entries == 0 {
            return Err(CloudError::InvalidConfig(
                "thumbnails.max_entries must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("FORMLINK_CLIENT_ID") {
            debug!(client_id = %id, "Overriding client ID from environment");
            self.auth.client_id = id;
        }

        if let Ok(secret) = std::env::var("FORMLINK_CLIENT_SECRET") {
            self.auth.client_secret = secret;
        }

        if let Ok(token) = std::env::var("FORMLINK_REFRESH_TOKEN") {
            self.auth.refresh_token = Some(token);
        }

        if let Ok(url) = std::env::var("FORMLINK_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Ok(interval) = std::env::var("FORMLINK_POLL_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(secs) => self.polling.interval_secs = secs,
                Err(_) => warn!(value = %interval, "Ignoring non-numeric poll interval"),
            }
        }

        if let Ok(flag) = std::env::var("FORMLINK_THUMBNAILS") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => self.thumbnails.enabled = true,
                "0" | "false" | "off" | "no" => self.thumbnails.enabled = false,
                _ => warn!(value = %flag, "Unknown thumbnail flag in environment"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "formlink", "formlink")
            .map(|dirs| dirs.config_dir().join("bridge.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn base_url(&self) -> CloudResult<Url> {
        parse_http_url("api.base_url", &self.api.base_url)
    }

    pub fn token_url(&self) -> CloudResult<Url> {
        parse_http_url("api.token_url", &self.api.token_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.api.token_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    /// Normalizer tuned by `polling.online_max_age_secs` and
    /// `thumbnails.default_ttl_secs`.
    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(
            chrono::Duration::seconds(clamp_secs(self.polling.online_max_age_secs)),
            chrono::Duration::seconds(clamp_secs(self.thumbnails.default_ttl_secs)),
        )
    }

    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy::new(self.polling.stale_after_failures)
    }
}

/// Largest second count a chrono duration accepts.
fn clamp_secs(secs: u64) -> i64 {
    secs.min((i64::MAX / 1000) as u64) as i64
}

fn parse_http_url(field: &str, raw: &str) -> CloudResult<Url> {
    let url = Url::parse(raw).map_err(|e| CloudError::InvalidUrl(format!("{field}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CloudError::InvalidUrl(format!(
            "{field} must use http:// or https://, got: {raw}"
        )));
    }
    Ok(url)
}
