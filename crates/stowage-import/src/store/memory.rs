//! In-process record store
//!
//! Mirrors the transactional behaviour of the Postgres store closely
//! enough to exercise the pipeline without a database: batches are all or
//! nothing, the unique key is enforced, rollback is atomic. Faults can be
//! injected to simulate rejected rows, outages and slow commits.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::audit::{AuditEntry, CreateAuditEntry};
use crate::catalog::TableSpec;
use crate::import::dedup::composite_key;
use crate::import::types::{
    ConflictPolicy, FailedRow, NewUpload, UploadRecord, UploadStatus, UploadTotals,
};
use crate::import::validate::{CleanRow, FieldValue};

type RejectFn = Box<dyn Fn(&CleanRow) -> Option<String> + Send + Sync>;

/// A row as stored in a business table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub upload_id: Uuid,
    pub key: Option<String>,
    pub values: Vec<FieldValue>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<StoredRow>>,
    uploads: HashMap<Uuid, UploadRecord>,
    failed_rows: HashMap<Uuid, Vec<FailedRow>>,
    audit_log: Vec<AuditEntry>,
    committed_batches: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    reject: Option<RejectFn>,
    unavailable: AtomicBool,
    /// Inserts allowed before the store starts refusing connections
    insert_budget: Mutex<Option<usize>>,
    insert_calls: AtomicUsize,
    insert_delay: Option<Duration>,
}

fn audit_record(entry: &CreateAuditEntry) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4(),
        action: entry.action.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        table_key: entry.table_key.clone(),
        user_id: entry.actor.user_id.clone(),
        ip_address: entry.actor.ip_address.clone(),
        user_agent: entry.actor.user_agent.clone(),
        row_key: entry.row_key.clone(),
        column_name: entry.column_name.clone(),
        old_value: entry.old_value.clone(),
        new_value: entry.new_value.clone(),
        rows_affected: entry.rows_affected,
        upload_id: entry.upload_id,
        batch_id: entry.batch_id,
        reason: entry.reason.clone(),
        metadata: entry.metadata.clone(),
        created_at: Utc::now(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any batch containing a row for which `reject` returns a reason.
    pub fn with_row_rejection<F>(mut self, reject: F) -> Self
    where
        F: Fn(&CleanRow) -> Option<String> + Send + Sync + 'static,
    {
        self.reject = Some(Box::new(reject));
        self
    }

    /// Sleep before every insert, to widen the window for cancellation.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// Go offline after `inserts` successful or failed insert calls.
    pub fn fail_after_inserts(self, inserts: usize) -> Self {
        *self.insert_budget.lock().unwrap_or_else(|e| e.into_inner()) = Some(inserts);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed a business table with rows that belong to no upload.
    pub fn seed(&self, table: &TableSpec, rows: Vec<Vec<FieldValue>>) {
        let mut state = self.lock();
        let stored = state.tables.entry(table.table_name.clone()).or_default();
        for values in rows {
            stored.push(StoredRow {
                upload_id: Uuid::nil(),
                key: composite_key(table, &values),
                values,
            });
        }
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn rows_for_upload(&self, table: &str, upload_id: Uuid) -> Vec<StoredRow> {
        self.rows(table)
            .into_iter()
            .filter(|r| r.upload_id == upload_id)
            .collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit_log.clone()
    }

    pub fn committed_batches(&self) -> usize {
        self.lock().committed_batches
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }

    fn spend_insert_budget(&self) -> StoreResult<()> {
        let calls = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let budget = *self.insert_budget.lock().unwrap_or_else(|e| e.into_inner());
        if budget.is_some_and(|limit| calls >= limit) {
            self.set_unavailable(true);
        }
        self.check_available()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_upload(&self, upload: &NewUpload) -> StoreResult<()> {
        self.check_available()?;
        let now = Utc::now();
        let record = UploadRecord {
            id: upload.id,
            table_key: upload.table_key.clone(),
            file_name: upload.file_name.clone(),
            file_size: upload.file_size.map(|s| s as i64),
            csv_headers: None,
            status: UploadStatus::Active.as_str().to_string(),
            outcome: None,
            total_rows: 0,
            rows_inserted: 0,
            rows_skipped: 0,
            rows_failed: 0,
            duration_ms: None,
            error: None,
            user_id: upload.actor.user_id.clone(),
            ip_address: upload.actor.ip_address.clone(),
            user_agent: upload.actor.user_agent.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            rolled_back_at: None,
            deleted_at: None,
        };
        self.lock().uploads.insert(upload.id, record);
        Ok(())
    }

    async fn record_headers(&self, upload_id: Uuid, headers: &[String]) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&upload_id)
            .ok_or(StoreError::UploadNotFound(upload_id))?;
        if upload.csv_headers.is_none() {
            upload.csv_headers = Some(headers.to_vec());
        }
        Ok(())
    }

    async fn existing_keys(&self, table: &TableSpec, keys: &[String]) -> StoreResult<HashSet<String>> {
        self.check_available()?;
        let wanted: HashSet<&String> = keys.iter().collect();
        let state = self.lock();
        Ok(state
            .tables
            .get(&table.table_name)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.key.as_ref())
                    .filter(|k| wanted.contains(k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_batch(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        rows: &[CleanRow],
        policy: ConflictPolicy,
    ) -> StoreResult<u64> {
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        self.spend_insert_budget()?;

        if let Some(reject) = &self.reject {
            if let Some(reason) = rows.iter().find_map(|row| reject(row)) {
                return Err(StoreError::Rejected(reason));
            }
        }

        let mut state = self.lock();
        let stored = state.tables.entry(table.table_name.clone()).or_default();

        // Stage into a copy so a conflict leaves the table untouched.
        let mut staged = stored.clone();
        for row in rows {
            let key = composite_key(table, &row.values);
            let existing = key
                .as_ref()
                .and_then(|k| staged.iter().position(|r| r.key.as_ref() == Some(k)));

            match (existing, policy) {
                (Some(index), ConflictPolicy::Update) => {
                    staged[index].values = row.values.clone();
                    staged[index].upload_id = upload_id;
                }
                (Some(_), ConflictPolicy::Skip) => {
                    return Err(StoreError::rejected(format!(
                        "duplicate key value violates unique constraint on {}",
                        table.table_name
                    )));
                }
                (None, _) => staged.push(StoredRow {
                    upload_id,
                    key,
                    values: row.values.clone(),
                }),
            }
        }

        *stored = staged;
        state.committed_batches += 1;
        Ok(rows.len() as u64)
    }

    async fn record_failed_rows(&self, upload_id: Uuid, rows: &[FailedRow]) -> StoreResult<()> {
        self.check_available()?;
        self.lock()
            .failed_rows
            .entry(upload_id)
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn finish_upload(
        &self,
        upload_id: Uuid,
        totals: &UploadTotals,
        audit: &CreateAuditEntry,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&upload_id)
            .ok_or(StoreError::UploadNotFound(upload_id))?;

        let now = Utc::now();
        upload.outcome = Some(totals.phase.as_str().to_string());
        upload.total_rows = totals.total_rows as i64;
        upload.rows_inserted = totals.inserted as i64;
        upload.rows_skipped = totals.skipped as i64;
        upload.rows_failed = totals.failed as i64;
        upload.duration_ms = Some(totals.duration_ms as i64);
        upload.error = totals.error.clone();
        upload.completed_at = Some(now);
        upload.updated_at = now;

        state.audit_log.push(audit_record(audit));
        Ok(())
    }

    async fn rollback_upload(
        &self,
        table: &TableSpec,
        upload_id: Uuid,
        mut audit: CreateAuditEntry,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.lock();

        match state.uploads.get(&upload_id).map(UploadRecord::status) {
            None => return Err(StoreError::UploadNotFound(upload_id)),
            Some(UploadStatus::RolledBack) => return Err(StoreError::AlreadyRolledBack(upload_id)),
            Some(UploadStatus::Active) => {}
        }

        let deleted = match state.tables.get_mut(&table.table_name) {
            Some(rows) => {
                let before = rows.len();
                rows.retain(|r| r.upload_id != upload_id);
                (before - rows.len()) as u64
            }
            None => 0,
        };

        let now = Utc::now();
        if let Some(upload) = state.uploads.get_mut(&upload_id) {
            upload.status = UploadStatus::RolledBack.as_str().to_string();
            upload.rolled_back_at = Some(now);
            upload.updated_at = now;
        }

        audit.rows_affected = Some(deleted as i64);
        state.audit_log.push(audit_record(&audit));
        Ok(deleted)
    }

    async fn get_upload(&self, upload_id: Uuid) -> StoreResult<Option<UploadRecord>> {
        self.check_available()?;
        Ok(self.lock().uploads.get(&upload_id).cloned())
    }

    async fn failed_rows(&self, upload_id: Uuid) -> StoreResult<Vec<FailedRow>> {
        self.check_available()?;
        let mut rows = self
            .lock()
            .failed_rows
            .get(&upload_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|r| r.line_number);
        Ok(rows)
    }

    async fn audit_trail(&self, upload_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        self.check_available()?;
        Ok(self
            .lock()
            .audit_log
            .iter()
            .filter(|e| e.upload_id == Some(upload_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::catalog::{FieldSpec, FieldType};

    fn table() -> TableSpec {
        TableSpec::new("people", "people")
            .field(FieldSpec::new("email", FieldType::Text))
            .with_unique_key(["email"])
    }

    fn row(line: u64, email: &str) -> CleanRow {
        CleanRow {
            line,
            values: vec![FieldValue::Text(Some(email.to_string()))],
            raw: vec![email.to_string()],
        }
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let upload = Uuid::new_v4();
        store
            .insert_batch(&table(), upload, &[row(2, "a@x.io")], ConflictPolicy::Skip)
            .await
            .unwrap();

        let err = store
            .insert_batch(
                &table(),
                upload,
                &[row(3, "b@x.io"), row(4, "a@x.io")],
                ConflictPolicy::Skip,
            )
            .await
            .unwrap_err();

        assert!(err.is_row_scoped());
        assert_eq!(store.rows("people").len(), 1);
        assert_eq!(store.committed_batches(), 1);
    }

    #[tokio::test]
    async fn test_update_policy_retags_existing_row() {
        let store = MemoryStore::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .insert_batch(&table(), first, &[row(2, "a@x.io")], ConflictPolicy::Skip)
            .await
            .unwrap();
        store
            .insert_batch(&table(), second, &[row(2, " a@x.io")], ConflictPolicy::Update)
            .await
            .unwrap();

        let rows = store.rows("people");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].upload_id, second);
    }

    #[tokio::test]
    async fn test_fail_after_inserts() {
        let store = MemoryStore::new().fail_after_inserts(1);
        let upload = Uuid::new_v4();
        assert!(store
            .insert_batch(&table(), upload, &[row(2, "a@x.io")], ConflictPolicy::Skip)
            .await
            .is_ok());
        let err = store
            .insert_batch(&table(), upload, &[row(3, "b@x.io")], ConflictPolicy::Skip)
            .await
            .unwrap_err();
        assert!(!err.is_row_scoped());
    }

    #[tokio::test]
    async fn test_rollback_removes_only_tagged_rows() {
        let store = MemoryStore::new();
        let table = table();
        store.seed(&table, vec![vec![FieldValue::Text(Some("old@x.io".into()))]]);

        let upload = NewUpload {
            id: Uuid::new_v4(),
            table_key: "people".into(),
            file_name: "people.csv".into(),
            file_size: None,
            actor: Default::default(),
        };
        store.create_upload(&upload).await.unwrap();
        store
            .insert_batch(&table, upload.id, &[row(2, "a@x.io"), row(3, "b@x.io")], ConflictPolicy::Skip)
            .await
            .unwrap();

        let audit = CreateAuditEntry::builder(AuditAction::UploadRollback)
            .upload_id(upload.id)
            .build();
        assert_eq!(store.rollback_upload(&table, upload.id, audit.clone()).await.unwrap(), 2);
        assert_eq!(store.rows("people").len(), 1);
        assert_eq!(store.audit_entries()[0].rows_affected, Some(2));

        assert!(matches!(
            store.rollback_upload(&table, upload.id, audit).await,
            Err(StoreError::AlreadyRolledBack(_))
        ));
    }
}
