//! Append-only audit log
//!
//! The import pipeline writes one `upload` entry when an upload finishes
//! and one `upload_rollback` entry when it is rolled back; both carry the
//! upload id so the full trail of an upload can be listed. Row and bulk
//! edit actions share the table for tools that modify imported data.
//!
//! # Example
//!
//! ```no_run
//! use stowage_import::audit::{insert_audit_entry, AuditAction, CreateAuditEntry, Severity};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: &PgPool) -> Result<(), sqlx::Error> {
//! let entry = CreateAuditEntry::builder(AuditAction::BulkEdit)
//!     .severity(Severity::Warning)
//!     .table_key("customers")
//!     .rows_affected(120)
//!     .reason("tier migration")
//!     .build();
//!
//! insert_audit_entry(pool, &entry).await?;
//! # Ok(())
//! # }
//! ```

mod models;
mod queries;

pub use models::{AuditAction, AuditEntry, AuditEntryBuilder, CreateAuditEntry, Severity};
pub use queries::{audit_trail_for_upload, insert_audit_entry};
