//! Database queries for audit logs

use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::models::{AuditEntry, CreateAuditEntry};

const AUDIT_COLUMNS: &str = "id, action, severity, table_key, user_id, ip_address, user_agent, \
     row_key, column_name, old_value, new_value, rows_affected, upload_id, batch_id, \
     reason, metadata, created_at";

/// Append one audit entry.
///
/// Generic over the executor so the insert can join an open transaction
/// (upload completion, rollback).
pub async fn insert_audit_entry<'e, E>(
    executor: E,
    entry: &CreateAuditEntry,
) -> Result<AuditEntry, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        INSERT INTO audit_log (
            action, severity, table_key, user_id, ip_address, user_agent,
            row_key, column_name, old_value, new_value, rows_affected,
            upload_id, batch_id, reason, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {AUDIT_COLUMNS}
        "#
    );

    let record = sqlx::query_as::<_, AuditEntry>(&sql)
        .bind(entry.action.as_str())
        .bind(entry.severity.as_str())
        .bind(&entry.table_key)
        .bind(&entry.actor.user_id)
        .bind(&entry.actor.ip_address)
        .bind(&entry.actor.user_agent)
        .bind(&entry.row_key)
        .bind(&entry.column_name)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(entry.rows_affected)
        .bind(entry.upload_id)
        .bind(entry.batch_id)
        .bind(&entry.reason)
        .bind(&entry.metadata)
        .fetch_one(executor)
        .await?;

    debug!(
        audit_id = %record.id,
        action = %entry.action,
        severity = %entry.severity,
        "Created audit log entry"
    );

    Ok(record)
}

/// Every audit entry linked to an upload, oldest first
pub async fn audit_trail_for_upload(
    pool: &PgPool,
    upload_id: Uuid,
) -> Result<Vec<AuditEntry>, sqlx::Error> {
    let sql = format!(
        "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE upload_id = $1 ORDER BY created_at, id"
    );

    sqlx::query_as::<_, AuditEntry>(&sql)
        .bind(upload_id)
        .fetch_all(pool)
        .await
}
