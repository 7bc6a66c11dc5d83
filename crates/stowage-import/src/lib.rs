//! Stowage import pipeline
//!
//! Streams large delimited text files into Postgres tables:
//!
//! - byte-level sanitization (BOM, invalid UTF-8) under the CSV reader
//! - header-to-field mapping and per-field validation from a table catalog
//! - in-file and in-store deduplication on the table's unique key
//! - one transaction per batch, every row stamped with its upload id
//! - live progress, cancellation, and rollback by upload id
//!
//! Entry point is [`import::ImportService`], backed by a [`store::RecordStore`]
//! (Postgres in production, in-memory for tests and dry runs).

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod store;

pub use catalog::{FieldSpec, FieldType, TableCatalog, TableSpec};
pub use config::{Config, ImportSettings};
pub use error::{ImportError, ImportResult};
pub use import::ImportService;
