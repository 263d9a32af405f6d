//! # Error Types
//!
//! Domain-specific error types for storewatch-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  storewatch-core (this file)                                           │
//! │  └── CoreError        - Unknown enum names, malformed observations     │
//! │                                                                         │
//! │  storewatch-db                                                         │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  storewatch-sync                                                       │
//! │  └── SyncError        - Auth, collector, partial data, cache           │
//! │                                                                         │
//! │  Flow: CoreError → SyncError → ErrorClass (persisted on the run)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Platform name is not one of the tracked marketplaces.
    #[error("Unknown platform: '{0}'. Valid options: grab, foodpanda, deliveroo")]
    UnknownPlatform(String),

    /// Source name is not the partner feed or a tracked marketplace.
    #[error("Unknown source: '{0}'")]
    UnknownSource(String),

    /// Cache tier name is not recognised.
    #[error("Unknown cache tier: '{0}'. Valid options: fast, moderate, slow, very_slow")]
    UnknownTier(String),

    /// Run status stored in the database is not recognised.
    #[error("Unknown run status: '{0}'")]
    UnknownRunStatus(String),

    /// An observation cannot be turned into a snapshot.
    ///
    /// ## When This Occurs
    /// - Collector record without a shop id
    /// - Partner item with an empty id
    #[error("Invalid observation: {field} {reason}")]
    InvalidObservation { field: String, reason: String },
}

impl CoreError {
    /// Creates an InvalidObservation error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidObservation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnknownPlatform("ubereats".to_string());
        assert_eq!(
            err.to_string(),
            "Unknown platform: 'ubereats'. Valid options: grab, foodpanda, deliveroo"
        );

        let err = CoreError::invalid("shopId", "is required");
        assert_eq!(err.to_string(), "Invalid observation: shopId is required");
    }
}
