//! # Sync Error Types
//!
//! Error types for the sync pipeline.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Partner API   │  │     Collector           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Auth           │  │  CollectorExit          │ │
//! │  │  InvalidUrl     │  │  Http           │  │  CollectorTimeout       │ │
//! │  │  ConfigLoad     │  │  HttpStatus     │  │  CollectorParse         │ │
//! │  └─────────────────┘  └─────────────────┘  │  CollectorSpawn         │ │
//! │                                            │  Cancelled              │ │
//! │  ┌─────────────────┐  ┌─────────────────┐  └─────────────────────────┘ │
//! │  │    Storage      │  │      Data       │                              │
//! │  │                 │  │                 │                              │
//! │  │  Database       │  │  PartialData    │                              │
//! │  │  Cache          │  │  Serialization  │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant maps onto a persisted [`ErrorClass`] so failed runs can be
//! grouped by cause without parsing messages.

use thiserror::Error;

use storewatch_core::ErrorClass;
use storewatch_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all pipeline failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid partner base URL or endpoint.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Partner API Errors
    // =========================================================================
    /// Credentials rejected or token endpoint unreachable after retries.
    ///
    /// ## When This Occurs
    /// - Token endpoint returns 4xx or a non-zero envelope code
    /// - A data call is still unauthorized after one forced refresh
    /// - Another process holds the refresh lease for longer than the wait bound
    #[error("Partner authentication failed: {0}")]
    Auth(String),

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Partner returned a non-success status or envelope code.
    #[error("Partner API returned {status}: {message}")]
    HttpStatus { status: u16, message: String },

    // =========================================================================
    // Collector Errors
    // =========================================================================
    /// Collector exited with a non-zero code.
    #[error("Collector for {platform} exited with {code:?}")]
    CollectorExit {
        platform: String,
        code: Option<i32>,
        output: String,
    },

    /// Collector exceeded its wall-clock budget and was killed.
    #[error("Collector for {platform} timed out after {secs} seconds")]
    CollectorTimeout { platform: String, secs: u64 },

    /// Collector output held no usable JSON object.
    ///
    /// `output` carries the raw combined output for the log line.
    #[error("Collector output for {platform} could not be parsed: {reason}")]
    CollectorParse {
        platform: String,
        reason: String,
        output: String,
    },

    /// Collector command could not be started.
    #[error("Failed to start collector for {platform}: {reason}")]
    CollectorSpawn { platform: String, reason: String },

    /// Run was cancelled by shutdown.
    #[error("Cancelled")]
    Cancelled,

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// Some sources could not be read; the run continues without them.
    #[error("Partial data, failed sources: {}", .failed_sources.join(", "))]
    PartialData { failed_sources: Vec<String> },

    /// JSON (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Cache backend failed.
    #[error("Cache error: {0}")]
    Cache(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (join failures, invariant breaks).
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::HttpStatus {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Http(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        SyncError::Cache(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("task failed: {err}"))
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// The class persisted on a failed run.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => ErrorClass::Config,
            SyncError::Auth(_) => ErrorClass::Auth,
            SyncError::Http(_) | SyncError::HttpStatus { .. } => ErrorClass::PartialData,
            SyncError::CollectorTimeout { .. } => ErrorClass::Timeout,
            SyncError::CollectorParse { .. } => ErrorClass::Parse,
            SyncError::CollectorExit { .. } | SyncError::CollectorSpawn { .. } => {
                ErrorClass::Collector
            }
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::PartialData { .. } => ErrorClass::PartialData,
            SyncError::Serialization(_) => ErrorClass::Parse,
            SyncError::Database(_) | SyncError::Cache(_) => ErrorClass::Storage,
            SyncError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Returns true if the next scheduler tick may succeed without operator action.
    ///
    /// ## Retryable Errors
    /// - Network failures and 5xx responses
    /// - Collector timeouts and non-zero exits
    /// - Busy or locked database
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Rejected credentials
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(_)
            | SyncError::CollectorTimeout { .. }
            | SyncError::CollectorExit { .. }
            | SyncError::PartialData { .. }
            | SyncError::Cache(_) => true,
            SyncError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            SyncError::Database(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Raw collector output attached to the error, if any.
    pub fn collector_output(&self) -> Option<&str> {
        match self {
            SyncError::CollectorExit { output, .. } | SyncError::CollectorParse { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}
