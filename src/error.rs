use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::recommendations::UnlockState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into EngineError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Recommendation {id}: transition from '{from}' to '{to}' is not allowed")]
    InvalidTransition {
        id: i64,
        from: UnlockState,
        to: UnlockState,
    },

    #[error("Scan {scan_id} is busy with another operation - retry later")]
    ConcurrencyConflict { scan_id: i64 },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl EngineError {
    pub fn scan_not_found(scan_id: i64) -> Self {
        EngineError::NotFound {
            entity: "Scan",
            id: scan_id,
        }
    }

    pub fn recommendation_not_found(recommendation_id: i64) -> Self {
        EngineError::NotFound {
            entity: "Recommendation",
            id: recommendation_id,
        }
    }

    /// True for failures a caller can reasonably retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = EngineError::recommendation_not_found(42);
        assert_eq!(err.to_string(), "Recommendation 42 not found");

        let err = EngineError::scan_not_found(7);
        assert_eq!(err.to_string(), "Scan 7 not found");
    }

    #[test]
    fn test_invalid_transition_message_names_both_states() {
        let err = EngineError::InvalidTransition {
            id: 3,
            from: UnlockState::Skipped,
            to: UnlockState::Active,
        };
        let msg = err.to_string();
        assert!(msg.contains("skipped"));
        assert!(msg.contains("active"));
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(EngineError::ConcurrencyConflict { scan_id: 1 }.is_retryable());
        assert!(!EngineError::scan_not_found(1).is_retryable());
        assert!(!EngineError::Error("boom".into()).is_retryable());
    }
}
