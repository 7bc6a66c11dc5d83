//! Postgres-backed record store
//!
//! Business tables are addressed dynamically from the catalog, so every
//! statement here is built at runtime. Identifiers come from a validated
//! [`TableSpec`] and are always quoted; values are always bound.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::audit::{audit_trail_for_upload, insert_audit_entry, AuditEntry, CreateAuditEntry};
use crate::catalog::{FieldType, TableSpec, MAX_BIND_PARAMETERS};
use crate::import::types::{
    ConflictPolicy, FailedRow, FailureKind, NewUpload, UploadRecord, UploadStatus, UploadTotals,
};
use crate::import::validate::{CleanRow, FieldValue};

const UPLOAD_COLUMNS: &str = "id, table_key, file_name, file_size, csv_headers, status, outcome, \
     total_rows, rows_inserted, rows_skipped, rows_failed, duration_ms, error, \
     user_id, ip_address, user_agent, created_at, updated_at, completed_at, \
     rolled_back_at, deleted_at";

/// Bound parameters per quarantined row
const FAILED_ROW_PARAMS: usize = 5;

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL expression producing the composite key of a stored row, in the
/// same canonical form as `FieldValue::key_text`. Numeric parts drop
/// their trailing fractional zeros so the column's scale does not matter.
fn key_expression(table: &TableSpec) -> String {
    let parts: Vec<String> = table
        .unique_key_indices()
        .into_iter()
        .map(|i| {
            let field = &table.fields[i];
            let column = quote_ident(field.column());
            match field.field_type {
                FieldType::Numeric => format!("btrim(trim_scale({column})::text)"),
                _ => format!("btrim({column}::text)"),
            }
        })
        .collect();
    format!("concat_ws(chr(31), {})", parts.join(", "))
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn insert_statement<'a>(
        table: &TableSpec,
        upload_id: Uuid,
        rows: &'a [CleanRow],
        policy: ConflictPolicy,
    ) -> QueryBuilder<'a, Postgres> {
        let columns: Vec<String> = table.fields.iter().map(|f| quote_ident(f.column())).collect();

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({}, upload_id) ",
            quote_ident(&table.table_name),
            columns.join(", ")
        ));

        query.push_values(rows, |mut values, row| {
            for value in &row.values {
                match value {
                    FieldValue::Text(v) => values.push_bind(v.clone()),
                    FieldValue::Numeric(v) => values.push_bind(v.clone()),
                    FieldValue::Date(v) => values.push_bind(*v),
                    FieldValue::Boolean(v) => values.push_bind(*v),
                };
            }
            values.push_bind(upload_id);
        });

        if policy == ConflictPolicy::Update && table.has_unique_key() {
            let key_columns: Vec<String> = table
                .unique_key_indices()
                .into_iter()
                .map(|i| quote_ident(table.fields[i].column()))
                .collect();
            let assignments: Vec<String> = columns
                .iter()
                .map(String::as_str)
                .chain(["upload_id"])
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect();
            query.push(format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                key_columns.join(", "),
                assignments.join(", ")
            ));
        }

        query
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_upload(&self, upload: &NewUpload) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (id, table_key, file_name, file_size, user_id, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(upload.id)
        .bind(&upload.table_key)
        .bind(&upload.file_name)
        .bind(upload.file_size.map(|s| s as i64))
        .bind(&upload.actor.user_id)
        .bind(&upload.actor.ip_address)
        .bind(&upload.actor.user_agent)
        .execute(&self.pool)
        .await?;

        debug!(upload_id = %upload.id, table_key = %upload.table_key, "Created upload record");
        Ok(())
    }

    async fn record_headers(&self, upload_id: Uuid, headers: &[String]) -> StoreResult<()> {
        sqlx::query(
            "UPDATE uploads SET csv_headers = $2, updated_at = NOW() WHERE id = $1 AND csv_headers IS NULL",
        )
        .bind(upload_id)
        .bind(headers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_keys(&self, table: &TableSpec, keys: &[String]) -> StoreResult<HashSet<String>> {
        if keys.is_empty() || !table.has_unique_key() {
            return Ok(HashSet::new());
        }

        let key = key_expression(table);
        let sql = format!(
            "SELECT DISTINCT {key} FROM {} WHERE {key} = ANY($1)",
            quote_ident(&table.table_name)
        );

        let found: Vec<String> = sqlx::query_scalar(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn insert_batch(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        rows: &[CleanRow],
        policy: ConflictPolicy,
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let result = Self::insert_statement(table, upload_id, rows, policy)
            .build()
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            upload_id = %upload_id,
            table = %table.table_name,
            rows = result.rows_affected(),
            "Committed batch"
        );

        Ok(result.rows_affected())
    }

    async fn record_failed_rows(&self, upload_id: Uuid, rows: &[FailedRow]) -> StoreResult<()> {
        for chunk in rows.chunks(MAX_BIND_PARAMETERS / FAILED_ROW_PARAMS) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO failed_rows (upload_id, line_number, kind, reason, row_data) ",
            );
            query.push_values(chunk, |mut values, row| {
                values
                    .push_bind(upload_id)
                    .push_bind(row.line_number as i64)
                    .push_bind(row.kind.as_str())
                    .push_bind(row.reason.clone())
                    .push_bind(row.row_data.clone());
            });
            query.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn finish_upload(
        &self,
        upload_id: Uuid,
        totals: &UploadTotals,
        audit: &CreateAuditEntry,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE uploads
            SET outcome = $2, total_rows = $3, rows_inserted = $4, rows_skipped = $5,
                rows_failed = $6, duration_ms = $7, error = $8,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(totals.phase.as_str())
        .bind(totals.total_rows as i64)
        .bind(totals.inserted as i64)
        .bind(totals.skipped as i64)
        .bind(totals.failed as i64)
        .bind(totals.duration_ms as i64)
        .bind(&totals.error)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::UploadNotFound(upload_id));
        }

        insert_audit_entry(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_upload(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        mut audit: CreateAuditEntry,
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM uploads WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await?;

        match status.map(UploadStatus::from) {
            None => return Err(StoreError::UploadNotFound(upload_id)),
            Some(UploadStatus::RolledBack) => return Err(StoreError::AlreadyRolledBack(upload_id)),
            Some(UploadStatus::Active) => {}
        }

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE upload_id = $1",
            quote_ident(&table.table_name)
        ))
        .bind(upload_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE uploads
            SET status = $2, rolled_back_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(UploadStatus::RolledBack.as_str())
        .execute(&mut *tx)
        .await?;

        audit.rows_affected = Some(deleted as i64);
        insert_audit_entry(&mut *tx, &audit).await?;
        tx.commit().await?;

        info!(
            upload_id = %upload_id,
            table = %table.table_name,
            rows_deleted = deleted,
            "Rolled back upload"
        );

        Ok(deleted)
    }

    async fn get_upload(&self, upload_id: Uuid) -> StoreResult<Option<UploadRecord>> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1 AND deleted_at IS NULL");
        let record = sqlx::query_as::<_, UploadRecord>(&sql)
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn failed_rows(&self, upload_id: Uuid) -> StoreResult<Vec<FailedRow>> {
        let rows: Vec<(i64, String, String, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT line_number, kind, reason, row_data
            FROM failed_rows
            WHERE upload_id = $1
            ORDER BY line_number, id
            "#,
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(line, kind, reason, row_data)| {
                FailedRow::new(line.max(0) as u64, FailureKind::from(kind), reason, row_data)
            })
            .collect())
    }

    async fn audit_trail(&self, upload_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        Ok(audit_trail_for_upload(&self.pool, upload_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldSpec, FieldType};

    fn table() -> TableSpec {
        TableSpec::new("orders", "orders")
            .field(FieldSpec::new("order_no", FieldType::Text))
            .field(FieldSpec::new("region", FieldType::Text).with_db_column("region_code"))
            .field(FieldSpec::new("amount", FieldType::Numeric))
            .with_unique_key(["order_no", "region"])
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_key_expression_uses_db_columns() {
        assert_eq!(
            key_expression(&table()),
            "concat_ws(chr(31), btrim(\"order_no\"::text), btrim(\"region_code\"::text))"
        );
    }

    #[test]
    fn test_numeric_key_parts_drop_scale() {
        let table = TableSpec::new("prices", "prices")
            .field(FieldSpec::new("sku", FieldType::Text))
            .field(FieldSpec::new("amount", FieldType::Numeric))
            .with_unique_key(["sku", "amount"]);

        assert_eq!(
            key_expression(&table),
            "concat_ws(chr(31), btrim(\"sku\"::text), btrim(trim_scale(\"amount\")::text))"
        );
    }

    #[test]
    fn test_upsert_statement() {
        let rows = vec![CleanRow {
            line: 2,
            values: vec![
                FieldValue::Text(Some("A-1".into())),
                FieldValue::Text(Some("eu".into())),
                FieldValue::Numeric(None),
            ],
            raw: vec![],
        }];
        let upsert =
            PgRecordStore::insert_statement(&table(), Uuid::new_v4(), &rows, ConflictPolicy::Update);
        let sql = upsert.sql();

        assert!(sql.starts_with(
            "INSERT INTO \"orders\" (\"order_no\", \"region_code\", \"amount\", upload_id) VALUES ($1, $2, $3, $4)"
        ));
        assert!(sql.contains("ON CONFLICT (\"order_no\", \"region_code\") DO UPDATE SET"));
        assert!(sql.ends_with("upload_id = EXCLUDED.upload_id"));

        let plain =
            PgRecordStore::insert_statement(&table(), Uuid::new_v4(), &rows, ConflictPolicy::Skip);
        assert!(!plain.sql().contains("ON CONFLICT"));
    }
}
