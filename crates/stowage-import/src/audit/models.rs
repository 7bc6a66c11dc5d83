//! Audit log data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::import::types::Actor;

/// Audit log entry from database
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: String,
    pub severity: String,
    pub table_key: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Single-row edits only
    pub row_key: Option<String>,
    pub column_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub rows_affected: Option<i64>,
    pub upload_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub reason: Option<String>,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn action(&self) -> Option<AuditAction> {
        AuditAction::parse(&self.action)
    }
}

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    UploadRollback,
    BulkEdit,
    RowEdit,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "upload",
            AuditAction::UploadRollback => "upload_rollback",
            AuditAction::BulkEdit => "bulk_edit",
            AuditAction::RowEdit => "row_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(AuditAction::Upload),
            "upload_rollback" => Some(AuditAction::UploadRollback),
            "bulk_edit" => Some(AuditAction::BulkEdit),
            "row_edit" => Some(AuditAction::RowEdit),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for creating a new audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAuditEntry {
    pub action: AuditAction,
    pub severity: Severity,
    pub table_key: Option<String>,
    pub actor: Actor,
    pub row_key: Option<String>,
    pub column_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub rows_affected: Option<i64>,
    pub upload_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub reason: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl CreateAuditEntry {
    pub fn builder(action: AuditAction) -> AuditEntryBuilder {
        AuditEntryBuilder {
            entry: CreateAuditEntry {
                action,
                severity: Severity::Info,
                table_key: None,
                actor: Actor::default(),
                row_key: None,
                column_name: None,
                old_value: None,
                new_value: None,
                rows_affected: None,
                upload_id: None,
                batch_id: None,
                reason: None,
                metadata: None,
            },
        }
    }
}

/// Builder for CreateAuditEntry
#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    entry: CreateAuditEntry,
}

impl AuditEntryBuilder {
    pub fn severity(mut self, severity: Severity) -> Self {
        self.entry.severity = severity;
        self
    }

    pub fn table_key(mut self, table_key: impl Into<String>) -> Self {
        self.entry.table_key = Some(table_key.into());
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.entry.actor = actor;
        self
    }

    /// Record a single-cell change
    pub fn row_edit(
        mut self,
        row_key: impl Into<String>,
        column_name: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        self.entry.row_key = Some(row_key.into());
        self.entry.column_name = Some(column_name.into());
        self.entry.old_value = old_value;
        self.entry.new_value = new_value;
        self
    }

    pub fn rows_affected(mut self, rows: u64) -> Self {
        self.entry.rows_affected = Some(rows as i64);
        self
    }

    pub fn upload_id(mut self, upload_id: Uuid) -> Self {
        self.entry.upload_id = Some(upload_id);
        self
    }

    pub fn batch_id(mut self, batch_id: Uuid) -> Self {
        self.entry.batch_id = Some(batch_id);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.entry.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.entry.metadata = Some(metadata);
        self
    }

    pub fn build(self) -> CreateAuditEntry {
        self.entry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_action_as_str() {
        assert_eq!(AuditAction::Upload.as_str(), "upload");
        assert_eq!(AuditAction::UploadRollback.as_str(), "upload_rollback");
        assert_eq!(AuditAction::parse("row_edit"), Some(AuditAction::RowEdit));
        assert_eq!(AuditAction::parse("delete"), None);
    }

    #[test]
    fn test_audit_entry_builder() {
        let upload_id = Uuid::new_v4();
        let entry = CreateAuditEntry::builder(AuditAction::UploadRollback)
            .severity(Severity::Warning)
            .table_key("customers")
            .actor(Actor::user("ops").with_ip_address("10.0.0.7"))
            .upload_id(upload_id)
            .rows_affected(42)
            .reason("bad export")
            .build();

        assert_eq!(entry.action, AuditAction::UploadRollback);
        assert_eq!(entry.severity, Severity::Warning);
        assert_eq!(entry.upload_id, Some(upload_id));
        assert_eq!(entry.rows_affected, Some(42));
        assert_eq!(entry.actor.ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_row_edit_fields() {
        let entry = CreateAuditEntry::builder(AuditAction::RowEdit)
            .row_edit("a@example.com", "tier", Some("free".into()), Some("pro".into()))
            .build();
        assert_eq!(entry.column_name.as_deref(), Some("tier"));
        assert_eq!(entry.old_value.as_deref(), Some("free"));
    }

    #[test]
    fn test_severity_serialization() {
        let json = serde_json::to_string(&Severity::Warning).unwrap();
        assert_eq!(json, r#""warning""#);
        let action: AuditAction = serde_json::from_str(r#""upload_rollback""#).unwrap();
        assert_eq!(action, AuditAction::UploadRollback);
    }
}
