//! Per-record decision: map, validate, deduplicate

use std::sync::Arc;

use super::dedup::{composite_key, display_key, Deduplicator, Seen};
use super::records::{ColumnMapping, ParsedRecord};
use super::types::{FailedRow, FailureKind, SkipReason, SkippedRow};
use super::validate::{validate_row, CleanRow};
use crate::catalog::TableSpec;

#[derive(Debug)]
pub enum RowOutcome {
    /// Ready for insertion; `key` is `None` for keyless rows
    Accepted { row: CleanRow, key: Option<String> },
    Failed(FailedRow),
    Skipped(SkippedRow),
}

/// Stateful row classifier shared by imports and dry-run analysis
pub struct RowStage {
    table: Arc<TableSpec>,
    mapping: ColumnMapping,
    dedup: Deduplicator,
}

impl RowStage {
    pub fn new(table: Arc<TableSpec>, mapping: ColumnMapping) -> Self {
        Self {
            table,
            mapping,
            dedup: Deduplicator::new(),
        }
    }

    pub fn process(&mut self, record: ParsedRecord) -> RowOutcome {
        let (line, fields) = match record {
            ParsedRecord::Malformed { line, reason, raw } => {
                return RowOutcome::Failed(FailedRow::new(line, FailureKind::Parse, reason, raw));
            }
            ParsedRecord::Row { line, fields } => (line, fields),
        };

        let mapped = self.mapping.apply(&fields);
        let values = match validate_row(&self.table, &mapped) {
            Ok(values) => values,
            Err(reason) => {
                return RowOutcome::Failed(FailedRow::new(
                    line,
                    FailureKind::Validation,
                    reason,
                    fields,
                ));
            }
        };

        let key = composite_key(&self.table, &values);
        if let Some(key) = &key {
            if let Seen::Duplicate { first_line } = self.dedup.observe(key, line) {
                return RowOutcome::Skipped(SkippedRow {
                    line_number: line,
                    reason: SkipReason::DuplicateInFile { first_line },
                    key: display_key(key),
                });
            }
        }

        RowOutcome::Accepted {
            row: CleanRow {
                line,
                values,
                raw: fields,
            },
            key,
        }
    }
}
