//! Request, result and bookkeeping types for uploads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::progress::Phase;

/// Bookkeeping status of an upload row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Active,
    RolledBack,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Active => "active",
            UploadStatus::RolledBack => "rolled_back",
        }
    }
}

impl From<String> for UploadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "rolled_back" => UploadStatus::RolledBack,
            _ => UploadStatus::Active,
        }
    }
}

/// What to do with a row whose unique key already exists in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Leave the stored row alone and report the incoming one as skipped
    #[default]
    Skip,
    /// Overwrite the stored row and re-tag it with this upload
    Update,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Update => "update",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(ConflictPolicy::Skip),
            "update" | "overwrite" => Ok(ConflictPolicy::Update),
            other => Err(format!("unknown conflict policy '{}'", other)),
        }
    }
}

/// Who started an operation, recorded on uploads and audit entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

/// Parameters of one streaming import
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub table_key: String,
    pub file_name: String,
    /// Size reported by the caller, if known
    pub declared_size: Option<u64>,
    /// Field name -> zero-based source column, for files whose headers
    /// do not match the table
    pub column_mapping: Option<HashMap<String, usize>>,
    pub conflict_policy: ConflictPolicy,
    pub actor: Actor,
}

impl ImportRequest {
    pub fn new(table_key: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            table_key: table_key.into(),
            file_name: file_name.into(),
            declared_size: None,
            column_mapping: None,
            conflict_policy: ConflictPolicy::default(),
            actor: Actor::default(),
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_column_mapping(mut self, mapping: HashMap<String, usize>) -> Self {
        self.column_mapping = Some(mapping);
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }
}

/// Why a row was quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Record could not be split into the expected fields
    Parse,
    /// A field failed its type or constraint check
    Validation,
    /// The store rejected the row on its own
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Parse => "parse",
            FailureKind::Validation => "validation",
            FailureKind::Storage => "storage",
        }
    }
}

impl From<String> for FailureKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "parse" => FailureKind::Parse,
            "storage" => FailureKind::Storage,
            _ => FailureKind::Validation,
        }
    }
}

/// A row that was read but not inserted because it is bad
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    /// Source line (header is line 1)
    pub line_number: u64,
    pub kind: FailureKind,
    pub reason: String,
    /// Field values exactly as received
    pub row_data: Vec<String>,
}

impl FailedRow {
    pub fn new(
        line_number: u64,
        kind: FailureKind,
        reason: impl Into<String>,
        row_data: Vec<String>,
    ) -> Self {
        Self {
            line_number,
            kind,
            reason: reason.into(),
            row_data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SkipReason {
    /// An earlier line of the same file had the same key
    DuplicateInFile { first_line: u64 },
    /// The key is already present in the target table
    ExistsInStore,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DuplicateInFile { first_line } => {
                write!(f, "duplicate of line {}", first_line)
            }
            SkipReason::ExistsInStore => write!(f, "key already exists"),
        }
    }
}

/// A valid row that was not inserted because of its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub line_number: u64,
    pub reason: SkipReason,
    pub key: String,
}

/// Final outcome of an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub upload_id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub phase: Phase,
    pub total_rows: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Capped at `max_reported_rows`; the counters are always exact
    pub failed_rows: Vec<FailedRow>,
    pub skipped_rows: Vec<SkippedRow>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadReport {
    pub fn is_clean(&self) -> bool {
        self.phase == Phase::Complete && self.failed == 0
    }

    /// Rebuild a report from the persisted upload row, for uploads that
    /// have left the in-memory registry.
    pub fn from_record(record: &UploadRecord, failed_rows: Vec<FailedRow>) -> Self {
        Self {
            upload_id: record.id,
            table_key: record.table_key.clone(),
            file_name: record.file_name.clone(),
            phase: record.outcome.clone().map(Phase::from).unwrap_or(Phase::Starting),
            total_rows: record.total_rows.max(0) as u64,
            inserted: record.rows_inserted.max(0) as u64,
            skipped: record.rows_skipped.max(0) as u64,
            failed: record.rows_failed.max(0) as u64,
            failed_rows,
            skipped_rows: Vec::new(),
            duration_ms: record.duration_ms.unwrap_or(0).max(0) as u64,
            error: record.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub upload_id: Uuid,
    pub rows_deleted: u64,
}

/// Row written when an upload starts
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub actor: Actor,
}

/// Final counters written when an upload reaches a terminal phase
#[derive(Debug, Clone)]
pub struct UploadTotals {
    pub phase: Phase,
    pub total_rows: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Persisted upload row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadRecord {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub csv_headers: Option<Vec<String>>,
    pub status: String,
    pub outcome: Option<String>,
    pub total_rows: i64,
    pub rows_inserted: i64,
    pub rows_skipped: i64,
    pub rows_failed: i64,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    pub fn status(&self) -> UploadStatus {
        UploadStatus::from(self.status.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_policy_from_str() {
        assert_eq!("skip".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Skip));
        assert_eq!("UPDATE".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Update));
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn test_skip_reason_serialization() {
        let json = serde_json::to_value(SkipReason::DuplicateInFile { first_line: 3 }).unwrap();
        assert_eq!(json["type"], "duplicate_in_file");
        assert_eq!(json["first_line"], 3);
        assert_eq!(SkipReason::ExistsInStore.to_string(), "key already exists");
    }

    #[test]
    fn test_upload_status_round_trip() {
        assert_eq!(
            UploadStatus::from(UploadStatus::RolledBack.as_str().to_string()),
            UploadStatus::RolledBack
        );
        assert_eq!(UploadStatus::from("active".to_string()), UploadStatus::Active);
    }
}
