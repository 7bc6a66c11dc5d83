//! Audit entries for upload completion and rollback

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::progress::Phase;
use super::registry::UploadRegistry;
use super::types::{Actor, RollbackOutcome, UploadStatus, UploadTotals};
use crate::audit::{AuditAction, CreateAuditEntry, Severity};
use crate::catalog::TableCatalog;
use crate::error::{ImportError, ImportResult};
use crate::store::RecordStore;

/// Severity of the completion entry: clean runs are info, partial ones
/// (failed rows, cancellation) a warning, failed uploads an error.
pub fn completion_severity(totals: &UploadTotals) -> Severity {
    match totals.phase {
        Phase::Failed => Severity::Error,
        Phase::Cancelled => Severity::Warning,
        _ if totals.failed > 0 => Severity::Warning,
        _ => Severity::Info,
    }
}

/// The `upload` entry written together with the final counters.
pub fn completion_entry(
    upload_id: Uuid,
    table_key: &str,
    file_name: &str,
    actor: &Actor,
    totals: &UploadTotals,
) -> CreateAuditEntry {
    let mut builder = CreateAuditEntry::builder(AuditAction::Upload)
        .severity(completion_severity(totals))
        .table_key(table_key)
        .actor(actor.clone())
        .upload_id(upload_id)
        .rows_affected(totals.inserted)
        .metadata(json!({
            "file_name": file_name,
            "outcome": totals.phase.as_str(),
            "total_rows": totals.total_rows,
            "inserted": totals.inserted,
            "skipped": totals.skipped,
            "failed": totals.failed,
            "duration_ms": totals.duration_ms,
        }));

    if let Some(error) = &totals.error {
        builder = builder.reason(error.clone());
    }

    builder.build()
}

/// Remove every row an upload inserted.
///
/// Refused only while the upload is live in the registry. An upload whose
/// completion was never recorded (outage, crashed process) can still be
/// rolled back. The store enforces the not-found and already-rolled-back
/// cases under a row lock.
pub async fn rollback_upload(
    store: &dyn RecordStore,
    catalog: &TableCatalog,
    registry: &UploadRegistry,
    upload_id: Uuid,
    actor: Actor,
    reason: Option<String>,
) -> ImportResult<RollbackOutcome> {
    if let Some(handle) = registry.get(upload_id) {
        if !handle.is_finished() {
            return Err(ImportError::InProgress(upload_id));
        }
    }

    let upload = store
        .get_upload(upload_id)
        .await?
        .ok_or(ImportError::NotFound(upload_id))?;

    if upload.status() == UploadStatus::RolledBack {
        return Err(ImportError::AlreadyRolledBack(upload_id));
    }

    let table = catalog
        .get(&upload.table_key)
        .ok_or_else(|| ImportError::UnknownTable(upload.table_key.clone()))?;

    let mut builder = CreateAuditEntry::builder(AuditAction::UploadRollback)
        .severity(Severity::Warning)
        .table_key(&upload.table_key)
        .actor(actor)
        .upload_id(upload_id)
        .metadata(json!({
            "file_name": upload.file_name,
            "rows_inserted": upload.rows_inserted,
        }));
    if let Some(reason) = reason {
        builder = builder.reason(reason);
    }

    let rows_deleted = store
        .rollback_upload(&table, upload_id, builder.build())
        .await?;

    info!(
        upload_id = %upload_id,
        table_key = %upload.table_key,
        rows_deleted,
        "Upload rolled back"
    );

    Ok(RollbackOutcome {
        upload_id,
        rows_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(phase: Phase, failed: u64) -> UploadTotals {
        UploadTotals {
            phase,
            total_rows: 10,
            inserted: 10 - failed,
            skipped: 0,
            failed,
            duration_ms: 12,
            error: None,
        }
    }

    #[test]
    fn test_completion_severity() {
        assert_eq!(completion_severity(&totals(Phase::Complete, 0)), Severity::Info);
        assert_eq!(completion_severity(&totals(Phase::Complete, 2)), Severity::Warning);
        assert_eq!(completion_severity(&totals(Phase::Cancelled, 0)), Severity::Warning);
        assert_eq!(completion_severity(&totals(Phase::Failed, 0)), Severity::Error);
    }

    #[test]
    fn test_completion_entry_links_upload() {
        let id = Uuid::new_v4();
        let mut totals = totals(Phase::Failed, 1);
        totals.error = Some("connection reset".into());

        let entry = completion_entry(id, "people", "people.csv", &Actor::user("u1"), &totals);

        assert_eq!(entry.action, AuditAction::Upload);
        assert_eq!(entry.upload_id, Some(id));
        assert_eq!(entry.rows_affected, Some(9));
        assert_eq!(entry.reason.as_deref(), Some("connection reset"));
        assert_eq!(entry.metadata.as_ref().map(|m| m["outcome"].clone()), Some(json!("failed")));
    }
}
