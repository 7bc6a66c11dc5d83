//! Persistence contract for the import pipeline
//!
//! The pipeline only talks to a [`RecordStore`]: upload bookkeeping,
//! batch inserts into business tables, failed-row quarantine, and the
//! audit entries written alongside completion and rollback.
//! [`PgRecordStore`] is the production implementation; [`MemoryStore`]
//! keeps everything in process for tests and dry runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditEntry, CreateAuditEntry};
use crate::catalog::TableSpec;
use crate::import::types::{ConflictPolicy, FailedRow, NewUpload, UploadRecord, UploadTotals};
use crate::import::validate::CleanRow;

pub use memory::MemoryStore;
pub use postgres::PgRecordStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The data was refused (constraint, bad value). Only the rows in the
    /// failing statement are affected; the store itself is healthy.
    #[error("Rejected by store: {0}")]
    Rejected(String),

    /// The store cannot be reached or is misconfigured. Fatal for the upload.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Upload {0} not found")]
    UploadNotFound(Uuid),

    #[error("Upload {0} has already been rolled back")]
    AlreadyRolledBack(Uuid),
}

impl StoreError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Whether retrying the rows one by one can succeed
    pub fn is_row_scoped(&self) -> bool {
        matches!(self, StoreError::Rejected(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // SQLSTATE class 22 (data exception) and 23 (integrity
            // constraint violation) are caused by the row values.
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) if code.starts_with("22") || code.starts_with("23") => {
                    StoreError::Rejected(db_err.message().to_string())
                }
                _ => StoreError::Unavailable(db_err.message().to_string()),
            },
            sqlx::Error::Encode(_) | sqlx::Error::ColumnDecode { .. } => {
                StoreError::Rejected(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the bookkeeping row for a new upload.
    async fn create_upload(&self, upload: &NewUpload) -> StoreResult<()>;

    /// Remember the headers of the file, once per upload.
    async fn record_headers(&self, upload_id: Uuid, headers: &[String]) -> StoreResult<()>;

    /// Which of `keys` already exist in the table (composite keys joined
    /// by U+001F, trimmed text of each part).
    async fn existing_keys(&self, table: &TableSpec, keys: &[String]) -> StoreResult<HashSet<String>>;

    /// Insert `rows` in one transaction, each stamped with `upload_id`.
    /// All or nothing; returns the number of rows written.
    async fn insert_batch(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        rows: &[CleanRow],
        policy: ConflictPolicy,
    ) -> StoreResult<u64>;

    async fn record_failed_rows(&self, upload_id: Uuid, rows: &[FailedRow]) -> StoreResult<()>;

    /// Store final counters and the completion audit entry atomically.
    async fn finish_upload(
        &self,
        upload_id: Uuid,
        totals: &UploadTotals,
        audit: &CreateAuditEntry,
    ) -> StoreResult<()>;

    /// Delete every row tagged with `upload_id`, mark the upload rolled
    /// back and append `audit` with `rows_affected` filled in, all in one
    /// transaction. Returns the number of rows deleted.
    async fn rollback_upload(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        audit: CreateAuditEntry,
    ) -> StoreResult<u64>;

    async fn get_upload(&self, upload_id: Uuid) -> StoreResult<Option<UploadRecord>>;

    /// Quarantined rows of an upload in line order
    async fn failed_rows(&self, upload_id: Uuid) -> StoreResult<Vec<FailedRow>>;

    async fn audit_trail(&self, upload_id: Uuid) -> StoreResult<Vec<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_scoped_classification() {
        assert!(StoreError::rejected("duplicate key").is_row_scoped());
        assert!(!StoreError::unavailable("connection refused").is_row_scoped());
        assert!(!StoreError::UploadNotFound(Uuid::new_v4()).is_row_scoped());
    }

    #[test]
    fn test_pool_errors_are_fatal() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
    }
}
