//! Streaming import service
//!
//! A file travels through these stages, one record at a time:
//!
//! ```text
//! reader ─▶ SanitizedReader ─▶ RecordReader ─▶ ColumnMapping ─▶ validate_row
//!        ─▶ Deduplicator ─▶ BatchWriter ─▶ RecordStore (one transaction per batch)
//! ```
//!
//! Each upload runs on its own task and is tracked in the [`UploadRegistry`].
//! Progress is published through a watch channel; callers subscribe, cancel,
//! fetch the final [`UploadReport`] and roll the upload back by id.
//!
//! # Example
//!
//! ```rust,ignore
//! let service = ImportService::new(store, catalog, settings);
//! let id = service.start_streaming_import(
//!     ImportRequest::new("people", "people.csv").with_declared_size(len),
//!     file,
//! )?;
//!
//! let mut events = service.subscribe(id)?;
//! while let Some(event) = events.next().await {
//!     println!("{}", event.to_sse()?);
//! }
//!
//! let report = service.get_result(id).await?;
//! ```

pub mod analyze;
pub mod audit_writer;
pub mod batch;
pub mod dedup;
pub mod export;
mod pipeline;
pub mod progress;
pub mod records;
pub mod registry;
pub mod sanitize;
pub mod stage;
pub mod types;
pub mod validate;

pub use analyze::AnalysisReport;
pub use progress::{Phase, Progress, ProgressEvent, ProgressSubscription};
pub use records::MappingError;
pub use registry::{UploadHandle, UploadRegistry};
pub use types::{
    Actor, ConflictPolicy, FailedRow, FailureKind, ImportRequest, RollbackOutcome, SkipReason,
    SkippedRow, UploadReport, UploadStatus,
};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::catalog::{TableCatalog, TableSpec};
use crate::config::ImportSettings;
use crate::error::{ImportError, ImportResult};
use crate::store::RecordStore;
use analyze::Analyzer;
use pipeline::UploadJob;

/// Entry point for imports, progress, results and rollback
#[derive(Clone)]
pub struct ImportService {
    store: Arc<dyn RecordStore>,
    catalog: Arc<TableCatalog>,
    registry: Arc<UploadRegistry>,
    settings: ImportSettings,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        catalog: Arc<TableCatalog>,
        settings: ImportSettings,
    ) -> Self {
        let registry = Arc::new(UploadRegistry::new(
            settings.max_concurrent_uploads,
            settings.result_retention,
        ));
        Self {
            store,
            catalog,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    fn table(&self, table_key: &str) -> ImportResult<Arc<TableSpec>> {
        self.catalog
            .get(table_key)
            .ok_or_else(|| ImportError::UnknownTable(table_key.to_string()))
    }

    /// Validate the request, claim a slot and start the upload in the
    /// background. Returns the upload id immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_streaming_import<R>(&self, request: ImportRequest, reader: R) -> ImportResult<Uuid>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let table = self.table(&request.table_key)?;

        if request.file_name.trim().is_empty() {
            return Err(ImportError::invalid_request("file name must not be empty"));
        }
        if let Some(size) = request.declared_size {
            if size > self.settings.max_upload_bytes {
                return Err(ImportError::FileTooLarge {
                    size,
                    limit: self.settings.max_upload_bytes,
                });
            }
        }
        if request.conflict_policy == ConflictPolicy::Update && !table.has_unique_key() {
            return Err(ImportError::invalid_request(format!(
                "conflict policy 'update' needs a unique key, table '{}' has none",
                table.key
            )));
        }

        let (handle, permit) =
            self.registry
                .register(&table.key, &request.file_name, request.declared_size)?;
        let upload_id = handle.id;

        info!(
            upload_id = %upload_id,
            table_key = %table.key,
            file_name = %request.file_name,
            declared_size = ?request.declared_size,
            conflict_policy = request.conflict_policy.as_str(),
            "Starting import"
        );

        let job = UploadJob {
            store: self.store.clone(),
            table,
            settings: self.settings.clone(),
            handle,
            request,
        };
        tokio::spawn(
            async move {
                job.run(reader).await;
                drop(permit);
            }
            .in_current_span(),
        );

        Ok(upload_id)
    }

    pub fn subscribe(&self, upload_id: Uuid) -> ImportResult<ProgressSubscription> {
        self.registry
            .get(upload_id)
            .map(|handle| handle.subscribe())
            .ok_or(ImportError::NotFound(upload_id))
    }

    /// Resume a progress stream after the last event a client saw.
    pub fn subscribe_after(
        &self,
        upload_id: Uuid,
        last_event_id: u64,
    ) -> ImportResult<ProgressSubscription> {
        self.registry
            .get(upload_id)
            .map(|handle| handle.progress().subscribe_after(last_event_id))
            .ok_or(ImportError::NotFound(upload_id))
    }

    pub fn progress(&self, upload_id: Uuid) -> ImportResult<Progress> {
        self.registry
            .get(upload_id)
            .map(|handle| handle.progress().snapshot())
            .ok_or(ImportError::NotFound(upload_id))
    }

    pub fn cancel(&self, upload_id: Uuid) -> ImportResult<()> {
        self.registry.cancel(upload_id)
    }

    /// Final report of an upload.
    ///
    /// Served from the registry while it is retained, otherwise rebuilt from
    /// the stored upload (with every persisted failed row).
    pub async fn get_result(&self, upload_id: Uuid) -> ImportResult<UploadReport> {
        if let Some(handle) = self.registry.get(upload_id) {
            return handle.result().ok_or(ImportError::InProgress(upload_id));
        }

        let record = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or(ImportError::NotFound(upload_id))?;
        if !record.is_finished() {
            return Err(ImportError::InProgress(upload_id));
        }

        let failed_rows = self.store.failed_rows(upload_id).await?;
        Ok(UploadReport::from_record(&record, failed_rows))
    }

    /// Wait for the upload to reach a terminal phase, then return its report.
    pub async fn wait_for_result(&self, upload_id: Uuid) -> ImportResult<UploadReport> {
        if let Ok(mut events) = self.subscribe(upload_id) {
            while events.next().await.is_some() {}
        }
        self.get_result(upload_id).await
    }

    /// Delete every row tagged with the upload and mark it rolled back.
    ///
    /// Under [`ConflictPolicy::Update`] the rows an upload overwrote carry
    /// its id, so they are deleted too even though they existed before the
    /// upload. Their previous values are not restored.
    pub async fn rollback(
        &self,
        upload_id: Uuid,
        actor: Actor,
        reason: Option<String>,
    ) -> ImportResult<RollbackOutcome> {
        audit_writer::rollback_upload(
            self.store.as_ref(),
            &self.catalog,
            &self.registry,
            upload_id,
            actor,
            reason,
        )
        .await
    }

    /// Classify every row of `bytes` without writing anything.
    pub async fn analyze_only(
        &self,
        table_key: &str,
        bytes: &[u8],
        column_mapping: Option<&HashMap<String, usize>>,
    ) -> ImportResult<AnalysisReport> {
        let analyzer = Analyzer {
            store: self.store.as_ref(),
            table: self.table(table_key)?,
            settings: &self.settings,
        };
        analyzer.run(bytes, column_mapping).await
    }

    /// Every stored failed row of an upload as CSV.
    pub async fn export_failed_rows(&self, upload_id: Uuid) -> ImportResult<Vec<u8>> {
        let record = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or(ImportError::NotFound(upload_id))?;
        let rows = self.store.failed_rows(upload_id).await?;
        export::failed_rows_csv(&record.csv_headers.unwrap_or_default(), &rows)
    }

    pub async fn audit_trail(&self, upload_id: Uuid) -> ImportResult<Vec<AuditEntry>> {
        Ok(self.store.audit_trail(upload_id).await?)
    }
}
