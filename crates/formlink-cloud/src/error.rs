//! # Cloud Error Types
//!
//! Typed errors raised by the token manager, cloud client and config layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Cloud Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Authorization  │  │     Transient           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AuthRejected   │  │  Timeout                │ │
//! │  │  InvalidUrl     │  │                 │  │  ConnectionFailed       │ │
//! │  │  ConfigLoad/Save│  │  needs re-auth  │  │  ServerError (5xx)      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Response     │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │ UnexpectedStatus│  │  ShuttingDown   │                              │
//! │  │ Deserialization │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! │                                                                         │
//! │  Only the reconciliation store decides what a failure means for the    │
//! │  entities; these types just carry the category.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Cloud error type.
///
/// `Clone` so one in-flight poll result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid bridge configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid API or token URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    /// Vendor rejected the credentials. Permanent until re-authorization.
    #[error("Authorization rejected: {0}")]
    AuthRejected(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Request exceeded its timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection could not be established or was reset.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Vendor returned a 5xx.
    #[error("Server error (HTTP {status})")]
    ServerError { status: u16 },

    // =========================================================================
    // Response Errors
    // =========================================================================
    /// Non-success status that is neither auth nor 5xx.
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// Response body could not be decoded.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Agent is shutting down.
    #[error("Polling agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CloudError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            CloudError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            CloudError::DeserializationFailed(err.to_string())
        } else if let Some(status) = err.status() {
            CloudError::from_status(status.as_u16(), err.to_string())
        } else {
            CloudError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::DeserializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for CloudError {
    fn from(err: url::ParseError) -> Self {
        CloudError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        CloudError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for CloudError {
    fn from(err: toml::de::Error) -> Self {
        CloudError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for CloudError {
    fn from(err: toml::ser::Error) -> Self {
        CloudError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl CloudError {
    /// Maps a non-success HTTP status onto a category.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => CloudError::AuthRejected(format!("HTTP {status}")),
            500..=599 => CloudError::ServerError { status },
            _ => CloudError::UnexpectedStatus {
                status,
                body: body.into(),
            },
        }
    }

    /// Returns true if re-authorization is required.
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::AuthRejected(_))
    }

    /// Returns true for network/5xx failures that the staleness policy
    /// absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Timeout(_) | CloudError::ConnectionFailed(_) | CloudError::ServerError { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CloudError::InvalidConfig(_)
                | CloudError::InvalidUrl(_)
                | CloudError::ConfigLoadFailed(_)
                | CloudError::ConfigSaveFailed(_)
        )
    }
}
