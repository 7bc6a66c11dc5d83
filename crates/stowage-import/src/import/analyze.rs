//! Dry-run analysis of a file against a table

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::dedup::ExistenceChecker;
use super::records::{ColumnMapping, MappingError, RecordReader};
use super::sanitize::{SanitizedReader, SourceStats};
use super::stage::{RowOutcome, RowStage};
use super::types::FailedRow;
use crate::catalog::TableSpec;
use crate::config::ImportSettings;
use crate::error::{ImportError, ImportResult};
use crate::store::RecordStore;

/// What an import of the file would do, without writing anything
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub headers: Vec<String>,
    /// Headers do not match the table and no mapping was given
    pub mapping_required: bool,
    pub expected_headers: Vec<String>,
    pub total_rows: u64,
    pub new_rows: u64,
    /// Repeats of a key seen earlier in the file
    pub duplicate_rows: u64,
    /// Keys already present in the table
    pub existing_rows: u64,
    pub invalid_rows: u64,
    /// First few parse and validation failures
    pub failures: Vec<FailedRow>,
    /// False once the existence check limit was reached
    pub existence_checked: bool,
}

pub(crate) struct Analyzer<'a> {
    pub store: &'a dyn RecordStore,
    pub table: Arc<TableSpec>,
    pub settings: &'a ImportSettings,
}

impl Analyzer<'_> {
    pub async fn run(
        &self,
        bytes: &[u8],
        column_mapping: Option<&HashMap<String, usize>>,
    ) -> ImportResult<AnalysisReport> {
        let size = bytes.len() as u64;
        if size > self.settings.max_upload_bytes {
            return Err(ImportError::FileTooLarge {
                size,
                limit: self.settings.max_upload_bytes,
            });
        }

        let mut report = AnalysisReport {
            expected_headers: self.table.expected_headers().map(str::to_string).collect(),
            existence_checked: true,
            ..AnalysisReport::default()
        };

        let mut reader = RecordReader::new(
            SanitizedReader::new(bytes, SourceStats::new()),
            self.settings.delimiter,
            self.settings.field_count_tolerance,
        );
        report.headers = reader
            .read_headers()
            .await
            .map_err(|err| ImportError::invalid_request(format!("failed to read headers: {err}")))?
            .ok_or_else(|| ImportError::invalid_request("file is empty"))?;

        let mapping = match ColumnMapping::resolve(&self.table, &report.headers, column_mapping) {
            Ok(mapping) => mapping,
            Err(MappingError::HeaderMismatch { .. }) => {
                report.mapping_required = true;
                return Ok(report);
            }
            Err(err) => return Err(err.into()),
        };

        let chunk = self.table.max_rows_per_statement().min(self.settings.batch_size.max(1));
        let mut existence = ExistenceChecker::new(self.settings.existence_check_limit);
        let mut stage = RowStage::new(self.table.clone(), mapping);
        let mut keys = Vec::with_capacity(chunk);

        while let Some(record) = reader.next_record().await? {
            report.total_rows += 1;
            match stage.process(record) {
                RowOutcome::Accepted { key: Some(key), .. } => {
                    keys.push(key);
                    if keys.len() >= chunk {
                        self.count_existing(&mut keys, &mut existence, &mut report)
                            .await?;
                    }
                }
                RowOutcome::Accepted { key: None, .. } => report.new_rows += 1,
                RowOutcome::Skipped(_) => report.duplicate_rows += 1,
                RowOutcome::Failed(row) => {
                    report.invalid_rows += 1;
                    if report.failures.len() < self.settings.max_reported_rows {
                        report.failures.push(row);
                    }
                }
            }
        }
        self.count_existing(&mut keys, &mut existence, &mut report)
            .await?;

        info!(
            table_key = %self.table.key,
            total_rows = report.total_rows,
            new_rows = report.new_rows,
            duplicate_rows = report.duplicate_rows,
            existing_rows = report.existing_rows,
            invalid_rows = report.invalid_rows,
            "Analysis finished"
        );
        Ok(report)
    }

    async fn count_existing(
        &self,
        keys: &mut Vec<String>,
        existence: &mut ExistenceChecker,
        report: &mut AnalysisReport,
    ) -> ImportResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let total = keys.len() as u64;

        // Analysis has no upload id of its own.
        if existence.allow(Uuid::nil(), keys.len()) {
            let found = self.store.existing_keys(&self.table, keys).await?;
            debug!(checked = keys.len(), found = found.len(), "Checked keys against table");
            let existing = keys.iter().filter(|k| found.contains(*k)).count() as u64;
            report.existing_rows += existing;
            report.new_rows += total - existing;
        } else {
            report.existence_checked = false;
            report.new_rows += total;
        }

        keys.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::{FieldSpec, FieldType};
    use crate::import::validate::FieldValue;
    use crate::store::MemoryStore;

    fn table() -> Arc<TableSpec> {
        Arc::new(
            TableSpec::new("people", "people")
                .field(FieldSpec::new("email", FieldType::Text).required())
                .field(FieldSpec::new("age", FieldType::Numeric))
                .with_unique_key(["email"]),
        )
    }

    async fn analyze(store: &MemoryStore, input: &str, settings: &ImportSettings) -> AnalysisReport {
        Analyzer {
            store,
            table: table(),
            settings,
        }
        .run(input.as_bytes(), None)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_counts_each_category() {
        let store = MemoryStore::new();
        store.seed(&table(), vec![vec![
            FieldValue::Text(Some("old@x.io".into())),
            FieldValue::Numeric(None),
        ]]);

        let input = "email,age\na@x.io,1\na@x.io,2\n,3\nold@x.io,4\nb@x.io,x\n";
        let report = analyze(&store, input, &ImportSettings::default()).await;

        assert_eq!(report.total_rows, 5);
        assert_eq!(report.new_rows, 1);
        assert_eq!(report.duplicate_rows, 1);
        assert_eq!(report.existing_rows, 1);
        assert_eq!(report.invalid_rows, 2);
        assert_eq!(report.failures[0].line_number, 4);
        assert!(report.existence_checked);
        // Nothing written
        assert!(store.rows("people").len() == 1);
    }

    #[tokio::test]
    async fn test_reports_missing_mapping() {
        let store = MemoryStore::new();
        let report = analyze(&store, "mail,years\na@x.io,1\n", &ImportSettings::default()).await;
        assert!(report.mapping_required);
        assert_eq!(report.total_rows, 0);
        assert_eq!(report.expected_headers, vec!["email", "age"]);
    }

    #[tokio::test]
    async fn test_existence_limit_fails_open() {
        let store = MemoryStore::new();
        let settings = ImportSettings {
            existence_check_limit: Some(0),
            ..ImportSettings::default()
        };
        let report = analyze(&store, "email,age\na@x.io,1\n", &settings).await;
        assert!(!report.existence_checked);
        assert_eq!(report.new_rows, 1);
    }
}
