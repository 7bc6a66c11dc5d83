//! Common test utilities for import integration tests
//!
//! Pipeline tests run against [`MemoryStore`]; only the Postgres store
//! tests need a database.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{csv, import, memory_service, people_request};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let (store, service) = memory_service();
//!     let report = import(&service, people_request(), csv(&["a@x.io,Ann,30"])).await;
//!     assert_eq!(report.inserted, 1);
//! }
//! ```

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;
use stowage_import::import::{ImportRequest, UploadReport};
use stowage_import::store::MemoryStore;
use stowage_import::{FieldSpec, FieldType, ImportService, ImportSettings, TableCatalog, TableSpec};

pub const PEOPLE_HEADER: &str = "email,name,age";

/// `people`: email (required, unique), name, age (numeric)
pub fn people_table() -> TableSpec {
    TableSpec::new("people", "people")
        .field(FieldSpec::new("email", FieldType::Text).required())
        .field(FieldSpec::new("name", FieldType::Text))
        .field(FieldSpec::new("age", FieldType::Numeric))
        .with_unique_key(["email"])
}

/// `notes`: keyless, every row is new
pub fn notes_table() -> TableSpec {
    TableSpec::new("notes", "notes").field(FieldSpec::new("body", FieldType::Text))
}

pub fn catalog() -> Arc<TableCatalog> {
    Arc::new(
        TableCatalog::new()
            .with_table(people_table())
            .unwrap()
            .with_table(notes_table())
            .unwrap(),
    )
}

/// Small batches and per-row progress so tests see several of each.
pub fn test_settings() -> ImportSettings {
    ImportSettings {
        batch_size: 2,
        progress_interval: 1,
        upload_timeout: Duration::from_secs(30),
        ..ImportSettings::default()
    }
}

pub fn service_with(store: Arc<MemoryStore>, settings: ImportSettings) -> ImportService {
    stowage_common::logging::init_test_logging();
    ImportService::new(store, catalog(), settings)
}

pub fn memory_service() -> (Arc<MemoryStore>, ImportService) {
    let store = Arc::new(MemoryStore::new());
    let service = service_with(store.clone(), test_settings());
    (store, service)
}

pub fn people_request() -> ImportRequest {
    ImportRequest::new("people", "people.csv")
}

/// People file: header line plus `rows`, newline terminated.
pub fn csv(rows: &[&str]) -> Vec<u8> {
    with_header(PEOPLE_HEADER, rows)
}

pub fn with_header(header: &str, rows: &[&str]) -> Vec<u8> {
    let mut out = String::from(header);
    out.push('\n');
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out.into_bytes()
}

/// `count` distinct people rows starting at `person0@x.io`.
pub fn people_rows(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("person{i}@x.io,Person {i},{}", 20 + i % 50))
        .collect()
}

/// Run an import to completion and return its report.
pub async fn import(service: &ImportService, request: ImportRequest, bytes: Vec<u8>) -> UploadReport {
    let id = service
        .start_streaming_import(request, std::io::Cursor::new(bytes))
        .unwrap();
    service.wait_for_result(id).await.unwrap()
}

/// Every row read lands in exactly one bucket.
pub fn assert_accounted(report: &UploadReport) {
    assert_eq!(
        report.inserted + report.skipped + report.failed,
        report.total_rows,
        "rows unaccounted for in {report:?}"
    );
}
