//! Postgres store tests
//!
//! Each test gets a fresh database with the workspace migrations applied.
//! Run with a reachable `DATABASE_URL` and `cargo test -- --ignored`.

#![allow(clippy::unwrap_used)]

use sqlx::PgPool;
use std::sync::Arc;
use stowage_import::import::validate::{CleanRow, FieldValue};
use stowage_import::import::{Actor, ConflictPolicy, ImportRequest, Phase, UploadStatus};
use stowage_import::store::{PgRecordStore, RecordStore};
use stowage_import::{ImportError, ImportService};
use uuid::Uuid;

mod common;
use common::*;

fn pg_service(pool: &PgPool) -> (Arc<PgRecordStore>, ImportService) {
    let store = Arc::new(PgRecordStore::new(pool.clone()));
    let service = ImportService::new(store.clone(), catalog(), test_settings());
    (store, service)
}

async fn count_rows(pool: &PgPool, upload_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM people WHERE upload_id = $1")
        .bind(upload_id)
        .fetch_one(pool)
        .await
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a Postgres database (DATABASE_URL)"]
async fn test_import_records_upload(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let (store, service) = pg_service(&pool);
    let bytes = csv(&["a@x.io,Ann,\"$1,234.56\"", "a@x.io,Ann,1", "b@x.io,Bob,x"]);

    let report = import(&service, people_request().with_actor(Actor::user("tester")), bytes).await;

    assert_eq!(report.phase, Phase::Complete);
    assert_eq!((report.inserted, report.skipped, report.failed), (1, 1, 1));
    assert_eq!(count_rows(&pool, report.upload_id).await?, 1);

    let age: String = sqlx::query_scalar("SELECT age::text FROM people WHERE email = 'a@x.io'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(age, "1234.56");

    let record = store.get_upload(report.upload_id).await?.ok_or("missing upload")?;
    assert_eq!(record.outcome.as_deref(), Some("complete"));
    assert_eq!(record.rows_inserted, 1);
    assert_eq!(record.user_id.as_deref(), Some("tester"));
    assert_eq!(
        record.csv_headers,
        Some(vec!["email".to_string(), "name".to_string(), "age".to_string()])
    );

    let failed = store.failed_rows(report.upload_id).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].line_number, 4);
    assert_eq!(failed[0].row_data, vec!["b@x.io", "Bob", "x"]);

    let trail = store.audit_trail(report.upload_id).await?;
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, "upload");
    assert_eq!(trail[0].severity, "warning");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a Postgres database (DATABASE_URL)"]
async fn test_rollback_in_postgres(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let (store, service) = pg_service(&pool);
    sqlx::query("INSERT INTO people (email, name) VALUES ('seed@x.io', 'Seed')")
        .execute(&pool)
        .await?;

    let report = import(&service, people_request(), csv(&["a@x.io,Ann,1", "b@x.io,Bob,2"])).await;
    assert_eq!(count_rows(&pool, report.upload_id).await?, 2);

    let outcome = service
        .rollback(report.upload_id, Actor::user("ops"), None)
        .await?;
    assert_eq!(outcome.rows_deleted, 2);
    assert_eq!(count_rows(&pool, report.upload_id).await?, 0);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM people")
        .fetch_one(&pool)
        .await?;
    assert_eq!(total, 1);

    let record = store.get_upload(report.upload_id).await?.ok_or("missing upload")?;
    assert_eq!(record.status(), UploadStatus::RolledBack);
    assert!(record.rolled_back_at.is_some());

    let again = service.rollback(report.upload_id, Actor::default(), None).await;
    assert!(matches!(again, Err(ImportError::AlreadyRolledBack(_))));

    let trail = store.audit_trail(report.upload_id).await?;
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[1].rows_affected, Some(2));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a Postgres database (DATABASE_URL)"]
async fn test_existing_keys_and_conflicts(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let store = PgRecordStore::new(pool.clone());
    let table = people_table();
    sqlx::query("INSERT INTO people (email, name) VALUES (' seed@x.io ', 'Seed')")
        .execute(&pool)
        .await?;

    let found = store
        .existing_keys(&table, &["seed@x.io".to_string(), "new@x.io".to_string()])
        .await?;
    assert!(found.contains("seed@x.io"));
    assert_eq!(found.len(), 1);

    let upload = Uuid::new_v4();
    let row = |line: u64, email: &str, name: &str| CleanRow {
        line,
        values: vec![
            FieldValue::Text(Some(email.to_string())),
            FieldValue::Text(Some(name.to_string())),
            FieldValue::Numeric(None),
        ],
        raw: vec![email.to_string(), name.to_string(), String::new()],
    };

    // The unique constraint rejects the whole batch as a row-scoped error
    let err = store
        .insert_batch(
            &table,
            upload,
            &[row(2, "fresh@x.io", "Fresh"), row(3, " seed@x.io ", "Again")],
            ConflictPolicy::Skip,
        )
        .await
        .unwrap_err();
    assert!(err.is_row_scoped());
    assert_eq!(count_rows(&pool, upload).await?, 0);

    let written = store
        .insert_batch(
            &table,
            upload,
            &[row(2, " seed@x.io ", "Updated")],
            ConflictPolicy::Update,
        )
        .await?;
    assert_eq!(written, 1);
    let name: String = sqlx::query_scalar("SELECT name FROM people WHERE upload_id = $1")
        .bind(upload)
        .fetch_one(&pool)
        .await?;
    assert_eq!(name, "Updated");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a Postgres database (DATABASE_URL)"]
async fn test_failed_row_export(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let (_store, service) = pg_service(&pool);
    let report = import(
        &service,
        ImportRequest::new("people", "bad.csv"),
        csv(&["a@x.io,Ann,x", ",Nobody,1"]),
    )
    .await;
    assert_eq!(report.failed, 2);

    let exported = String::from_utf8(service.export_failed_rows(report.upload_id).await?)?;
    let lines: Vec<&str> = exported.lines().collect();
    assert_eq!(lines[0], "line,reason,email,name,age");
    assert!(lines[1].starts_with("2,"));
    assert!(lines[2].starts_with("3,"));

    Ok(())
}
