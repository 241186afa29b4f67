//! Error types for import and hold workflows
//!
//! Errors are classified by recoverability:
//! - Retryable: the database was locked by another writer
//! - NonRetryable: corrupt snapshots, unreadable files, schema failures
//! - RequiresUserAction: decisions that need a different input from the operator
//!
//! Row-level problems inside a batch are not errors; they become FAIL or
//! HOLD classifications. These types cover whole-operation failures.

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum ImportError {
    // Retryable or not, depending on the SQLite error
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    // Non-retryable errors
    #[error("Spreadsheet error: {0}")]
    Sheet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hold {0} has an unreadable snapshot: {1}")]
    CorruptSnapshot(i64, String),

    // Requires user action
    #[error("Hold {0} not found")]
    HoldNotFound(i64),

    #[error("Hold {0} is already resolved")]
    HoldAlreadyResolved(i64),

    #[error("Mapping a hold needs a target customer")]
    TargetRequired,

    #[error("Customer {0} not found")]
    CustomerNotFound(i64),

    #[error("Unknown decision: {0}")]
    UnknownDecision(String),
}

impl ImportError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ImportError::Db(e) => e.is_busy(),
            _ => false,
        }
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ImportError::HoldNotFound(_)
                | ImportError::HoldAlreadyResolved(_)
                | ImportError::TargetRequired
                | ImportError::CustomerNotFound(_)
                | ImportError::UnknownDecision(_)
        )
    }

    /// Stable machine-readable code for the UI.
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Db(_) => "DB_ERROR",
            ImportError::Sheet(_) => "SHEET_ERROR",
            ImportError::Config(_) => "CONFIG_ERROR",
            ImportError::CorruptSnapshot(..) => "CORRUPT_SNAPSHOT",
            ImportError::HoldNotFound(_) => "HOLD_NOT_FOUND",
            ImportError::HoldAlreadyResolved(_) => "HOLD_ALREADY_RESOLVED",
            ImportError::TargetRequired => "TARGET_REQUIRED",
            ImportError::CustomerNotFound(_) => "CUSTOMER_NOT_FOUND",
            ImportError::UnknownDecision(_) => "UNKNOWN_DECISION",
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ImportError::Db(e) if e.is_busy() => {
                "Another program is writing to the database. Try again shortly."
            }
            ImportError::Db(_) => "Check the database file and disk space.",
            ImportError::Sheet(_) => "Check the file is a readable xlsx, xls or ods workbook.",
            ImportError::Config(_) => "Check your configuration in ~/.agentbook/config.json",
            ImportError::CorruptSnapshot(..) => "Re-upload the original file to rebuild the hold.",
            ImportError::HoldNotFound(_) => "Refresh the hold list and pick an existing hold.",
            ImportError::HoldAlreadyResolved(_) => {
                "This row is already applied; no further decision is needed."
            }
            ImportError::TargetRequired => "Choose the existing customer to map this row to.",
            ImportError::CustomerNotFound(_) => "Choose a customer from the candidate list.",
            ImportError::UnknownDecision(_) => "Use MAP_EXISTING, CREATE_NEW or SKIP.",
        }
    }
}

/// Serializable error representation for the UI collaborator
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&ImportError> for ErrorPayload {
    fn from(err: &ImportError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ImportError::HoldAlreadyResolved(4);
        assert!(err.requires_user_action());
        assert!(!err.is_retryable());

        let err = ImportError::Sheet("bad zip".into());
        assert!(!err.requires_user_action());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_database_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = ImportError::from(DbError::from(busy));
        assert!(err.is_retryable());
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.error_type, ErrorType::Retryable);
        assert!(payload.can_retry);
        assert_eq!(payload.code, "DB_ERROR");
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let payload = ErrorPayload::from(&ImportError::TargetRequired);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["errorType"], "requiresuseraction");
        assert_eq!(json["code"], "TARGET_REQUIRED");
        assert!(json["recoverySuggestion"].as_str().unwrap().contains("customer"));
    }
}
