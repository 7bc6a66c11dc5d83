//! One upload, from first byte to final report

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::audit_writer::completion_entry;
use super::batch::BatchWriter;
use super::progress::Phase;
use super::records::{ColumnMapping, RecordReader};
use super::registry::UploadHandle;
use super::sanitize::{SanitizedReader, SourceStats};
use super::stage::{RowOutcome, RowStage};
use super::types::{FailedRow, ImportRequest, NewUpload, SkippedRow, UploadReport, UploadTotals};
use crate::catalog::TableSpec;
use crate::config::ImportSettings;
use crate::store::RecordStore;

/// Why the read loop stopped
#[derive(Debug)]
enum Stop {
    Finished,
    Cancelled,
    Fatal(String),
}

/// Running counters; the row lists are capped, the counters are not.
#[derive(Debug, Default)]
struct Tally {
    rows_read: u64,
    inserted: u64,
    skipped: u64,
    failed: u64,
    failed_rows: Vec<FailedRow>,
    skipped_rows: Vec<SkippedRow>,
    cap: usize,
    batches: u64,
    /// Invalid UTF-8 sequences replaced in the source
    replacements: u64,
}

impl Tally {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    fn skip(&mut self, row: SkippedRow) {
        self.skipped += 1;
        if self.skipped_rows.len() < self.cap {
            self.skipped_rows.push(row);
        }
    }

    fn fail(&mut self, rows: Vec<FailedRow>) {
        self.failed += rows.len() as u64;
        let room = self.cap.saturating_sub(self.failed_rows.len());
        self.failed_rows.extend(rows.into_iter().take(room));
    }
}

/// Rows expected in total, extrapolated from the bytes consumed so far.
fn estimate_total(rows_read: u64, bytes_read: u64, file_size: Option<u64>) -> Option<u64> {
    let size = file_size?;
    if rows_read == 0 || bytes_read == 0 {
        return None;
    }
    let estimate = u128::from(rows_read) * u128::from(size) / u128::from(bytes_read);
    Some(u64::try_from(estimate).unwrap_or(u64::MAX).max(rows_read))
}

pub(crate) struct UploadJob {
    pub store: Arc<dyn RecordStore>,
    pub table: Arc<TableSpec>,
    pub settings: ImportSettings,
    pub handle: Arc<UploadHandle>,
    pub request: ImportRequest,
}

impl UploadJob {
    /// Drive the upload to a terminal phase. Never returns an error: every
    /// outcome ends up in the handle's report.
    #[tracing::instrument(skip_all, fields(upload_id = %self.handle.id, table_key = %self.table.key))]
    pub async fn run<R>(self, source: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let timed_out = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        self.spawn_timeout(done.clone(), timed_out.clone());

        let mut tally = Tally::new(self.settings.max_reported_rows);
        let stop = {
            let _timer = done.drop_guard();
            self.execute(source, &mut tally).await
        };

        self.finish(stop, tally, started, timed_out.load(Ordering::SeqCst))
            .await;
    }

    fn spawn_timeout(&self, done: CancellationToken, timed_out: Arc<AtomicBool>) {
        let cancel = self.handle.cancel_token().clone();
        let timeout = self.settings.upload_timeout;
        let upload_id = self.handle.id;

        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        upload_id = %upload_id,
                        timeout_secs = timeout.as_secs(),
                        "Upload timed out, cancelling"
                    );
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            }
        });
    }

    async fn execute<R>(&self, source: R, tally: &mut Tally) -> Stop
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = self.handle.id;
        let cancel = self.handle.cancel_token().clone();

        let upload = NewUpload {
            id,
            table_key: self.table.key.clone(),
            file_name: self.request.file_name.clone(),
            file_size: self.request.declared_size,
            actor: self.request.actor.clone(),
        };
        if let Err(err) = self.store.create_upload(&upload).await {
            return Stop::Fatal(format!("failed to register upload: {err}"));
        }

        let stats = SourceStats::new();
        let mut reader = RecordReader::new(
            SanitizedReader::new(source, stats.clone()),
            self.settings.delimiter,
            self.settings.field_count_tolerance,
        );
        self.handle.progress().update(|p| p.phase = Phase::Reading);

        let headers = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Stop::Cancelled,
            headers = reader.read_headers() => headers,
        };
        let headers = match headers {
            Ok(Some(headers)) => headers,
            Ok(None) => return Stop::Fatal("file is empty".to_string()),
            Err(err) => return Stop::Fatal(format!("failed to read headers: {err}")),
        };

        let mapping = match ColumnMapping::resolve(
            &self.table,
            &headers,
            self.request.column_mapping.as_ref(),
        ) {
            Ok(mapping) => mapping,
            Err(err) => return Stop::Fatal(err.to_string()),
        };
        if let Err(err) = self.store.record_headers(id, &headers).await {
            return Stop::Fatal(format!("failed to record headers: {err}"));
        }
        debug!(upload_id = %id, headers = headers.len(), identity = mapping.is_identity(), "Headers resolved");

        let mut stage = RowStage::new(self.table.clone(), mapping);
        let mut batch = BatchWriter::new(
            self.store.clone(),
            self.table.clone(),
            id,
            self.request.conflict_policy,
            self.settings.batch_size,
            self.settings.existence_check_limit,
        );
        let mut failures = Vec::new();
        let interval = self.settings.progress_interval.max(1);

        let stop = loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                record = reader.next_record() => record,
            };
            let record = match record {
                Ok(Some(record)) => record,
                Ok(None) => break Stop::Finished,
                Err(err) => break Stop::Fatal(format!("failed to read file: {err}")),
            };

            if stats.bytes() > self.settings.max_upload_bytes {
                break Stop::Fatal(format!(
                    "file exceeds the upload limit of {} bytes",
                    self.settings.max_upload_bytes
                ));
            }

            tally.rows_read += 1;
            match stage.process(record) {
                RowOutcome::Accepted { row, key } => batch.push(row, key),
                RowOutcome::Failed(row) => failures.push(row),
                RowOutcome::Skipped(row) => tally.skip(row),
            }

            if batch.is_full() || failures.len() >= batch.capacity() {
                if let Err(stop) = self.flush(&mut batch, &mut failures, tally, &stats).await {
                    break stop;
                }
            }

            if tally.rows_read % interval == 0 {
                self.publish(tally, &stats, Phase::Validating);
            }
        };

        // Rows already accumulated are committed whatever stopped the loop.
        let stop = match self.flush(&mut batch, &mut failures, tally, &stats).await {
            Ok(()) => stop,
            Err(fatal) => match stop {
                Stop::Fatal(_) => stop,
                _ => fatal,
            },
        };
        tally.batches = batch.batches_committed();
        tally.replacements = stats.replacements();
        stop
    }

    /// Commit the pending batch and persist the failures gathered since the
    /// last flush, in line order.
    async fn flush(
        &self,
        batch: &mut BatchWriter,
        failures: &mut Vec<FailedRow>,
        tally: &mut Tally,
        stats: &SourceStats,
    ) -> Result<(), Stop> {
        if batch.is_empty() && failures.is_empty() {
            return Ok(());
        }
        if !batch.is_empty() {
            self.publish(tally, stats, Phase::Inserting);
        }

        let outcome = batch.flush().await;
        tally.inserted += outcome.inserted;
        for row in outcome.skipped {
            tally.skip(row);
        }
        failures.extend(outcome.failed);
        failures.sort_by_key(|row| row.line_number);

        let mut fatal = outcome.fatal.map(|err| Stop::Fatal(err.to_string()));
        if !failures.is_empty() {
            if let Err(err) = self.store.record_failed_rows(self.handle.id, failures).await {
                warn!(
                    upload_id = %self.handle.id,
                    rows = failures.len(),
                    error = %err,
                    "Failed to persist rejected rows"
                );
                fatal.get_or_insert(Stop::Fatal(format!("failed to record rejected rows: {err}")));
            }
        }
        tally.fail(std::mem::take(failures));

        self.publish(tally, stats, Phase::Inserting);
        fatal.map_or(Ok(()), Err)
    }

    fn publish(&self, tally: &Tally, stats: &SourceStats, phase: Phase) {
        let bytes_read = stats.bytes();
        let total = estimate_total(tally.rows_read, bytes_read, self.request.declared_size);
        self.handle.progress().update(|p| {
            p.phase = phase;
            p.current_row = tally.rows_read;
            if total.is_some() {
                p.total_rows = total;
            }
            p.inserted = tally.inserted;
            p.skipped = tally.skipped;
            p.failed = tally.failed;
            p.bytes_read = bytes_read;
        });
    }

    async fn finish(&self, stop: Stop, mut tally: Tally, started: Instant, timed_out: bool) {
        let id = self.handle.id;
        let (mut phase, mut error) = match stop {
            Stop::Finished => (Phase::Complete, None),
            Stop::Cancelled if timed_out => (
                Phase::Cancelled,
                Some(format!(
                    "upload timed out after {}s",
                    self.settings.upload_timeout.as_secs()
                )),
            ),
            Stop::Cancelled => (Phase::Cancelled, None),
            Stop::Fatal(message) => (Phase::Failed, Some(message)),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let totals = UploadTotals {
            phase,
            total_rows: tally.rows_read,
            inserted: tally.inserted,
            skipped: tally.skipped,
            failed: tally.failed,
            duration_ms,
            error: error.clone(),
        };
        let audit = completion_entry(
            id,
            &self.table.key,
            &self.request.file_name,
            &self.request.actor,
            &totals,
        );

        if let Err(err) = self.store.finish_upload(id, &totals, &audit).await {
            error!(upload_id = %id, error = %err, "Failed to record upload outcome");
            if phase == Phase::Complete {
                phase = Phase::Failed;
            }
            error.get_or_insert_with(|| format!("failed to record upload outcome: {err}"));
        }

        info!(
            upload_id = %id,
            table_key = %self.table.key,
            outcome = %phase,
            total_rows = tally.rows_read,
            inserted = tally.inserted,
            skipped = tally.skipped,
            failed = tally.failed,
            batches = tally.batches,
            replacements = tally.replacements,
            duration_ms,
            "Upload finished"
        );

        tally.skipped_rows.sort_by_key(|row| row.line_number);
        self.handle.finish(UploadReport {
            upload_id: id,
            table_key: self.table.key.clone(),
            file_name: self.request.file_name.clone(),
            phase,
            total_rows: tally.rows_read,
            inserted: tally.inserted,
            skipped: tally.skipped,
            failed: tally.failed,
            failed_rows: tally.failed_rows,
            skipped_rows: tally.skipped_rows,
            duration_ms,
            error,
        });
    }
}
