//! Stowage CLI - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use stowage_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use stowage_import::db;
use stowage_import::import::{Actor, ConflictPolicy, ImportRequest};
use stowage_import::store::PgRecordStore;
use stowage_import::{Config, ImportService, TableCatalog};
use tracing::error;
use uuid::Uuid;

/// Stowage - streaming delimited-text imports into Postgres
#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Table catalog (overrides STOWAGE_CATALOG)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Recorded as the acting user on uploads and audit entries
    #[arg(long, env = "STOWAGE_USER", global = true)]
    user: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Import a file into a catalog table
    Import {
        /// Table key from the catalog
        table: String,

        /// Delimited text file
        file: PathBuf,

        /// Explicit column mapping, e.g. `--map email=0 --map name=2`
        #[arg(short, long = "map", value_parser = parse_mapping)]
        mapping: Vec<(String, usize)>,

        /// What to do with rows whose key already exists: skip or update.
        /// Updated rows are deleted if this upload is later rolled back
        #[arg(long, default_value = "skip")]
        conflict: ConflictPolicy,

        /// Print every progress event
        #[arg(long)]
        progress: bool,
    },

    /// Dry run: classify the rows of a file without writing
    Analyze {
        table: String,
        file: PathBuf,
        #[arg(short, long = "map", value_parser = parse_mapping)]
        mapping: Vec<(String, usize)>,
    },

    /// Delete every row an upload inserted
    ///
    /// Rows that an `--conflict update` import overwrote belong to that upload
    /// afterwards and are deleted too; their previous values are not restored.
    Rollback {
        upload_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Export the rejected rows of an upload as CSV
    Failures {
        upload_id: Uuid,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the audit trail of an upload
    Audit { upload_id: Uuid },
}

fn parse_mapping(value: &str) -> std::result::Result<(String, usize), String> {
    let (field, index) = value
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=COLUMN, got '{}'", value))?;
    let index = index
        .trim()
        .parse()
        .map_err(|_| format!("column index '{}' is not a number", index))?;
    Ok((field.trim().to_string(), index))
}

fn mapping_arg(pairs: &[(String, usize)]) -> Option<HashMap<String, usize>> {
    (!pairs.is_empty()).then(|| pairs.iter().cloned().collect())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("stowage")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(catalog) = cli.catalog {
        config.catalog_path = catalog;
    }

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        db::run_migrations(&pool).await?;
        println!("Migrations applied");
        return Ok(());
    }

    let catalog = TableCatalog::from_file(&config.catalog_path).with_context(|| {
        format!(
            "Failed to load table catalog from {}",
            config.catalog_path.display()
        )
    })?;
    let service = ImportService::new(
        Arc::new(PgRecordStore::new(pool)),
        Arc::new(catalog),
        config.import.clone(),
    );
    let actor = cli.user.map(Actor::user).unwrap_or_default();

    match cli.command {
        Commands::Migrate => Ok(()),

        Commands::Import {
            table,
            file,
            mapping,
            conflict,
            progress,
        } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let size = source.metadata().await?.len();
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let mut request = ImportRequest::new(table, file_name)
                .with_declared_size(size)
                .with_conflict_policy(conflict)
                .with_actor(actor);
            if let Some(mapping) = mapping_arg(&mapping) {
                request = request.with_column_mapping(mapping);
            }

            let upload_id = service.start_streaming_import(request, source)?;
            eprintln!("Upload {} started", upload_id);

            let mut events = service.subscribe(upload_id)?;
            while let Some(event) = events.next().await {
                let p = &event.progress;
                if progress || event.is_terminal() {
                    eprintln!(
                        "[{}] row {}/{} inserted={} skipped={} failed={}",
                        p.phase,
                        p.current_row,
                        p.total_rows.map_or_else(|| "?".to_string(), |t| t.to_string()),
                        p.inserted,
                        p.skipped,
                        p.failed
                    );
                }
            }

            let report = service.get_result(upload_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(error) = report.error {
                anyhow::bail!("upload {} ended {}: {}", upload_id, report.phase, error);
            }
            Ok(())
        }

        Commands::Analyze {
            table,
            file,
            mapping,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let report = service
                .analyze_only(&table, &bytes, mapping_arg(&mapping).as_ref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Rollback { upload_id, reason } => {
            let outcome = service.rollback(upload_id, actor, reason).await?;
            println!(
                "Rolled back upload {}: {} rows deleted",
                outcome.upload_id, outcome.rows_deleted
            );
            Ok(())
        }

        Commands::Failures { upload_id, output } => {
            let csv = service.export_failed_rows(upload_id).await?;
            match output {
                Some(path) => tokio::fs::write(&path, csv)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&csv)?;
                }
            }
            Ok(())
        }

        Commands::Audit { upload_id } => {
            let entries = service.audit_trail(upload_id).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rollback_help_mentions_updated_rows() {
        let command = Cli::command();
        let help = command
            .find_subcommand("rollback")
            .and_then(|rollback| rollback.get_long_about())
            .map(ToString::to_string)
            .unwrap_or_default();
        assert!(help.contains("--conflict update"));
    }

    #[test]
    fn test_parse_mapping() {
        assert_eq!(parse_mapping("email=2"), Ok(("email".to_string(), 2)));
        assert!(parse_mapping("email").is_err());
        assert!(parse_mapping("email=x").is_err());
    }

    #[test]
    fn test_import_arguments() {
        let cli = Cli::parse_from([
            "stowage", "import", "people", "people.csv", "--map", "email=1", "--conflict", "update",
        ]);
        match cli.command {
            Commands::Import {
                mapping, conflict, ..
            } => {
                assert_eq!(mapping, vec![("email".to_string(), 1)]);
                assert_eq!(conflict, ConflictPolicy::Update);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
