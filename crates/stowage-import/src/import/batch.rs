//! Bounded batches and their commit

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::dedup::{display_key, ExistenceChecker};
use super::types::{ConflictPolicy, FailedRow, FailureKind, SkipReason, SkippedRow};
use super::validate::CleanRow;
use crate::catalog::TableSpec;
use crate::store::{RecordStore, StoreError};

/// What happened to the rows of one flushed batch
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub skipped: Vec<SkippedRow>,
    pub failed: Vec<FailedRow>,
    /// Set when the store went away; rows not committed are in `failed`
    pub fatal: Option<StoreError>,
}

impl BatchOutcome {
    fn fail_all(&mut self, rows: Vec<CleanRow>, err: StoreError) {
        self.failed.extend(rows.into_iter().map(|row| {
            FailedRow::new(row.line, FailureKind::Storage, err.to_string(), row.raw)
        }));
        self.fatal = Some(err);
    }
}

/// Accumulates accepted rows and commits them one transaction per batch.
pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    table: Arc<TableSpec>,
    upload_id: Uuid,
    policy: ConflictPolicy,
    capacity: usize,
    pending: Vec<(CleanRow, Option<String>)>,
    existence: ExistenceChecker,
    batches: u64,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: Arc<TableSpec>,
        upload_id: Uuid,
        policy: ConflictPolicy,
        batch_size: usize,
        existence_check_limit: Option<usize>,
    ) -> Self {
        let capacity = batch_size.clamp(1, table.max_rows_per_statement());
        Self {
            store,
            table,
            upload_id,
            policy,
            capacity,
            pending: Vec::with_capacity(capacity),
            existence: ExistenceChecker::new(existence_check_limit),
            batches: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, row: CleanRow, key: Option<String>) {
        self.pending.push((row, key));
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn batches_committed(&self) -> u64 {
        self.batches
    }

    /// Check keys against the table, then insert what is left.
    ///
    /// A row-scoped rejection aborts only this batch, whose rows are then
    /// retried one per transaction. Never returns with rows pending.
    pub async fn flush(&mut self) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if self.pending.is_empty() {
            return outcome;
        }

        let pending = std::mem::take(&mut self.pending);
        let rows = match self.drop_existing(pending, &mut outcome).await {
            Ok(rows) => rows,
            Err((rows, err)) => {
                outcome.fail_all(rows, err);
                return outcome;
            }
        };
        if rows.is_empty() {
            return outcome;
        }

        match self
            .store
            .insert_batch(&self.table, self.upload_id, &rows, self.policy)
            .await
        {
            Ok(inserted) => {
                self.batches += 1;
                outcome.inserted += inserted;
                debug!(
                    upload_id = %self.upload_id,
                    batch = self.batches,
                    rows = inserted,
                    "Batch committed"
                );
            }
            Err(err) if err.is_row_scoped() => {
                warn!(
                    upload_id = %self.upload_id,
                    rows = rows.len(),
                    first_line = rows[0].line,
                    error = %err,
                    "Batch rejected, retrying rows individually"
                );
                self.retry_rows(rows, &mut outcome).await;
            }
            Err(err) => outcome.fail_all(rows, err),
        }

        outcome
    }

    /// Under the skip policy, set aside rows whose key is already stored.
    async fn drop_existing(
        &mut self,
        pending: Vec<(CleanRow, Option<String>)>,
        outcome: &mut BatchOutcome,
    ) -> Result<Vec<CleanRow>, (Vec<CleanRow>, StoreError)> {
        let keys: Vec<String> = pending.iter().filter_map(|(_, k)| k.clone()).collect();
        let check = self.policy == ConflictPolicy::Skip
            && !keys.is_empty()
            && self.existence.allow(self.upload_id, keys.len());

        let existing: HashSet<String> = if check {
            match self.store.existing_keys(&self.table, &keys).await {
                Ok(found) => found,
                Err(err) => return Err((pending.into_iter().map(|(row, _)| row).collect(), err)),
            }
        } else {
            HashSet::new()
        };

        let mut rows = Vec::with_capacity(pending.len());
        for (row, key) in pending {
            match key {
                Some(key) if existing.contains(&key) => outcome.skipped.push(SkippedRow {
                    line_number: row.line,
                    reason: SkipReason::ExistsInStore,
                    key: display_key(&key),
                }),
                _ => rows.push(row),
            }
        }
        Ok(rows)
    }

    async fn retry_rows(&mut self, rows: Vec<CleanRow>, outcome: &mut BatchOutcome) {
        let mut rows = rows.into_iter();
        while let Some(row) = rows.next() {
            match self
                .store
                .insert_batch(&self.table, self.upload_id, std::slice::from_ref(&row), self.policy)
                .await
            {
                Ok(inserted) => {
                    self.batches += 1;
                    outcome.inserted += inserted;
                }
                Err(err) if err.is_row_scoped() => {
                    outcome
                        .failed
                        .push(FailedRow::new(row.line, FailureKind::Storage, err.to_string(), row.raw));
                }
                Err(err) => {
                    let mut remaining = vec![row];
                    remaining.extend(rows);
                    outcome.fail_all(remaining, err);
                    return;
                }
            }
        }
    }
}
