//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DbError {
    /// SQLite reported the database as busy or locked by another connection.
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(e) => is_busy_error(e),
            _ => false,
        }
    }

    /// A UNIQUE / CHECK / FK constraint rejected the write.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DbError::Sqlite(e) => is_constraint_error(e),
            _ => false,
        }
    }
}

pub(crate) fn is_constraint_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub(crate) fn is_busy_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// A row from the `customers` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCustomer {
    pub id: i64,
    pub name: String,
    pub name_norm: String,
    pub phone: Option<String>,
    pub phone_norm: String,
    pub birth_date: Option<String>,
    pub birth_norm: String,
    pub gender: Option<String>,
    pub region: Option<String>,
    pub address: Option<String>,
    pub email: Option<String>,
    pub source: Option<String>,
    pub memo: Option<String>,
    /// JSON object of columns the importer could not map.
    pub custom_data: Option<String>,
    pub match_key: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Customer fields as written by the importer and the hold workflow.
///
/// Blank strings mean "not provided"; on merge they never overwrite a
/// populated column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerFields {
    pub name: String,
    pub phone: String,
    pub birth_date: String,
    pub gender: String,
    pub region: String,
    pub address: String,
    pub email: String,
    pub source: String,
    pub memo: String,
    /// JSON object text, or empty.
    pub custom_data: String,
    /// Upstream match key; derived from name and phone when empty.
    pub match_key: String,
}

/// A row from the `contracts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContract {
    pub id: i64,
    pub customer_id: i64,
    pub company: Option<String>,
    pub product_name: Option<String>,
    pub policy_no: Option<String>,
    pub policy_no_norm: String,
    pub premium: i64,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub coverage_summary: Option<String>,
    pub insured_name: Option<String>,
    pub insured_phone: Option<String>,
    pub insured_birth: Option<String>,
    pub insured_gender: Option<String>,
    pub policyholder_name: Option<String>,
    pub policyholder_type: Option<String>,
    pub policyholder_norm: Option<String>,
    pub policyholder_phone: Option<String>,
    pub primary_role: Option<String>,
    pub key_hash: Option<String>,
    pub stable_hash: Option<String>,
    pub content_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Identity columns of a contract, as the reconciliation lookups see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractIdentity {
    pub id: i64,
    pub customer_id: i64,
    pub content_hash: String,
    pub key_hash: String,
    pub policy_no_norm: String,
}

/// Corporate search hit: the contract plus its customer's display fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorporateContract {
    pub contract: DbContract,
    pub customer_name: String,
    pub customer_phone: Option<String>,
}

/// A customer suggested for a held row, with why it was suggested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCandidate {
    pub customer_id: i64,
    pub name: String,
    pub phone: String,
    pub birth_date: String,
    pub score: u32,
    pub reason: String,
}

/// A row from the `upload_holds` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHold {
    pub id: i64,
    pub file_hash: String,
    pub row_no: u32,
    pub filename: Option<String>,
    pub reason_code: String,
    pub reason_msg: String,
    pub status: String,
    pub raw_json: String,
    pub normalized_json: String,
    pub corrected_json: String,
    pub candidates_json: String,
    pub row_payload_json: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Column values for inserting or refreshing a hold.
#[derive(Debug, Clone)]
pub struct HoldRecord {
    pub file_hash: String,
    pub row_no: u32,
    pub filename: String,
    pub reason_code: String,
    pub reason_msg: String,
    pub raw_json: String,
    pub normalized_json: String,
    pub candidates_json: String,
    pub row_payload_json: String,
}

/// Filter for hold listings. Empty vectors mean "any".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldFilter {
    #[serde(default)]
    pub statuses: Vec<String>,
    /// Matched against filename and the raw / normalized / corrected snapshots.
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Per-file hold counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldBatch {
    pub file_hash: String,
    pub filename: Option<String>,
    pub total: i64,
    pub open: i64,
    pub resolved: i64,
    pub skipped: i64,
    pub last_updated: String,
}

/// A row from the `upload_history` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: i64,
    pub file_hash: String,
    pub action: String,
    pub filename: Option<String>,
    pub filesize: Option<i64>,
    pub uploaded_at: String,
    pub summary_json: Option<String>,
}
