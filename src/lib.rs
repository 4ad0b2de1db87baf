//! Ragmill: a local-first RAG data plane.
//!
//! **Ragmill turns directories of code and documents into retrievable
//! chunks backed by per-source SQLite stores.**
//!
//! # Core Principles
//!
//! - **Local-first**: all state lives in one workspace directory, atomic
//!   and inspectable
//! - **Append-only batches**: every parse run is a batch; unchanged chunks
//!   are reused across batches, never rewritten
//! - **Manifest-mirrored**: database lifecycle state mirrors into a JSON
//!   manifest per source, with drift detected by health checks
//! - **Derived health**: health is always computed from disk, never stored
//!   as truth
//!
//! # Architecture
//!
//! A workspace holds `ragmill.toml`, `logs/`, `archives/`, `sources/` (one
//! subdirectory per source with `manifest.json` + `db.sqlite3`), a
//! `.locks/` namespace, and `.health.json`.
//!
//! - Manifest writes serialize on a sibling file lock and replace
//!   atomically with rotating backups.
//! - Database operations serialize on `.locks/db/<slug>.lock` and execute
//!   packaged UUIDv7-keyed migrations.
//! - Parser runs traverse the source (honoring `.gitignore` stacks), pick
//!   handlers by override/shebang/extension, and stage symbols and chunk
//!   slices through an idempotent upsert pipeline.
//!
//! # Crate Structure
//!
//! - [`core`]: workspace paths, locks, slugs, uuid7, config, health, errors
//! - [`modules`]: manifest, db lifecycle, parser pipeline, vdb contract

pub mod core;
pub mod modules;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::core::config::{AppConfig, Concurrency};
use crate::core::error::RagmillError;
use crate::core::health::write_health_document;
use crate::core::paths::{resolve_workspace_from_env, WorkspacePaths};
use crate::core::time::now_utc;
use crate::modules::db::DbLifecycleService;
use crate::modules::db_health::db_health_hook;
use crate::modules::parser::ParserService;
use crate::modules::parser_health::parser_health_hook;
use crate::modules::source::SourceService;

#[derive(Parser, Debug)]
#[clap(
    name = "ragmill",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local-first RAG data plane"
)]
struct Cli {
    /// Workspace root (overrides RAGMILL_WORKSPACE and the default).
    #[clap(long, global = true)]
    workspace: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the workspace layout and configuration file.
    Init,
    /// Manage configured sources.
    Source {
        #[clap(subcommand)]
        command: SourceCommand,
    },
    /// Manage per-source databases.
    Db {
        #[clap(subcommand)]
        command: DbCommand,
    },
    /// Plan and run parser batches.
    Parser {
        #[clap(subcommand)]
        command: ParserCommand,
    },
    /// Evaluate module health and refresh `.health.json`.
    Checkhealth,
}

#[derive(Subcommand, Debug)]
enum SourceCommand {
    /// Register a source for a target directory.
    Init {
        name: String,
        #[clap(long)]
        target: PathBuf,
    },
    /// List configured sources.
    List,
    /// Enable a source.
    Enable { name: String },
    /// Disable a source.
    Disable { name: String },
    /// Record a refresh timestamp and health snapshot.
    Refresh { name: String },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Create the database and apply the bootstrap (plus pending
    /// migrations when auto-upgrade is enabled).
    Ensure { source: String },
    /// Apply pending migrations.
    Upgrade {
        source: String,
        #[clap(long)]
        steps: Option<usize>,
    },
    /// Roll back applied migrations. Destructive.
    Downgrade {
        source: String,
        #[clap(long, default_value_t = 1)]
        steps: usize,
    },
    /// Show manifest and schema state.
    Info {
        source: String,
        #[clap(long)]
        schema: bool,
        #[clap(long)]
        counts: bool,
    },
    /// Run VACUUM maintenance.
    Vacuum {
        source: String,
        #[clap(long)]
        concurrency: Option<usize>,
    },
    /// Execute a SQL script against the source database.
    Run {
        source: String,
        sql_path: PathBuf,
        #[clap(long)]
        autocommit: bool,
    },
    /// Delete and re-bootstrap the database. Destructive.
    Reset {
        source: String,
        #[clap(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ParserCommand {
    /// Discover files and report the selected handlers without staging.
    Plan { source: String },
    /// Parse a source end to end: plan, handlers, staging, manifest.
    Parse {
        source: String,
        /// Restrict the run to paths under the source root.
        #[clap(long)]
        scope: Vec<PathBuf>,
        #[clap(long)]
        batch_ref: Option<String>,
    },
    /// Show the persisted parser state for a source.
    Info { source: String },
}

/// CLI entry point used by the `ragmill` binary.
pub fn run_cli() -> Result<(), RagmillError> {
    let cli = Cli::parse();
    let paths = resolve_workspace_from_env(cli.workspace.as_deref())?;
    let config = AppConfig::load(&paths.config_file)?;

    match cli.command {
        Command::Init => run_init(&paths, &config),
        Command::Source { command } => run_source(&paths, config, command),
        Command::Db { command } => run_db(&paths, &config, command),
        Command::Parser { command } => run_parser(&paths, &config, command),
        Command::Checkhealth => run_checkhealth(&paths, &config),
    }
}

fn run_init(paths: &WorkspacePaths, _config: &AppConfig) -> Result<(), RagmillError> {
    paths.ensure_layout()?;
    if !paths.config_file.exists() {
        let template = "\
# ragmill workspace configuration

[workspace]
# root = \"~/.ragmill\"

[modules.parser]
enabled = true
gitignore_behavior = \"combined\"

[db]
ensure_auto_upgrade = true
vacuum_max_stale_days = 7
";
        std::fs::write(&paths.config_file, template)?;
    }
    println!(
        "{} workspace ready at {}",
        "ok".green(),
        paths.workspace.display()
    );
    Ok(())
}

fn run_source(
    paths: &WorkspacePaths,
    mut config: AppConfig,
    command: SourceCommand,
) -> Result<(), RagmillError> {
    paths.ensure_layout()?;
    let service = SourceService::new(paths.clone(), &config);
    match command {
        SourceCommand::Init { name, target } => {
            let slug = service.init(&name, &target, &mut config)?;
            config.save(&paths.config_file)?;
            println!("{} source {} registered", "ok".green(), slug.bold());
        }
        SourceCommand::List => {
            for info in service.list(&config) {
                let state = if info.enabled {
                    "enabled".green()
                } else {
                    "disabled".yellow()
                };
                println!(
                    "{}  {}  {}  health={}",
                    info.name.bold(),
                    state,
                    info.path.display(),
                    info.health_status
                );
            }
        }
        SourceCommand::Enable { name } => {
            service.set_enabled(&name, true, &mut config)?;
            config.save(&paths.config_file)?;
            println!("{} source {} enabled", "ok".green(), name.bold());
        }
        SourceCommand::Disable { name } => {
            service.set_enabled(&name, false, &mut config)?;
            config.save(&paths.config_file)?;
            println!("{} source {} disabled", "ok".green(), name.bold());
        }
        SourceCommand::Refresh { name } => {
            let handle = crate::core::config::WorkspaceHandle {
                paths: paths.clone(),
                config: config.clone(),
            };
            let report = db_health_hook(&handle)
                .into_iter()
                .find(|report| report.name == name);
            match report {
                Some(report) => {
                    service.refresh(
                        &name,
                        report.status,
                        report.summary.as_deref(),
                        &report.actions,
                    )?;
                    println!("{} source {} refreshed ({})", "ok".green(), name.bold(), report.status);
                }
                None => {
                    service.refresh(&name, crate::core::health::HealthStatus::Unknown, None, &[])?;
                    println!("{} source {} refreshed", "ok".green(), name.bold());
                }
            }
        }
    }
    Ok(())
}

fn run_db(
    paths: &WorkspacePaths,
    config: &AppConfig,
    command: DbCommand,
) -> Result<(), RagmillError> {
    paths.ensure_layout()?;
    let service = DbLifecycleService::new(paths.clone(), config)?;
    match command {
        DbCommand::Ensure { source } => {
            let db_path = service.ensure(&source)?;
            println!("{} database ready at {}", "ok".green(), db_path.display());
        }
        DbCommand::Upgrade { source, steps } => {
            let applied = service.upgrade(&source, steps)?;
            if applied.is_empty() {
                println!("{} no pending migrations", "ok".green());
            } else {
                println!("{} applied: {}", "ok".green(), applied.join(", "));
            }
        }
        DbCommand::Downgrade { source, steps } => {
            let rolled_back = service.downgrade(&source, steps)?;
            if rolled_back.is_empty() {
                println!("{} nothing to roll back", "ok".green());
            } else {
                println!("{} rolled back: {}", "warn".yellow(), rolled_back.join(", "));
            }
        }
        DbCommand::Info {
            source,
            schema,
            counts,
        } => {
            let payload = service.info(&source, schema, counts)?;
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
        }
        DbCommand::Vacuum {
            source,
            concurrency,
        } => {
            service.vacuum(&source, concurrency.map(Concurrency::Fixed))?;
            println!("{} vacuum complete", "ok".green());
        }
        DbCommand::Run {
            source,
            sql_path,
            autocommit,
        } => {
            let autocommit = autocommit || config.db.run_autocommit_default;
            service.run(&source, &sql_path, autocommit)?;
            println!("{} script executed", "ok".green());
        }
        DbCommand::Reset { source, force } => {
            service.reset(&source, force)?;
            println!("{} database reset", "warn".yellow());
        }
    }
    Ok(())
}

fn run_parser(
    paths: &WorkspacePaths,
    config: &AppConfig,
    command: ParserCommand,
) -> Result<(), RagmillError> {
    paths.ensure_layout()?;
    let parser = ParserService::new(paths.clone(), config.clone())?;
    match command {
        ParserCommand::Plan { source } => {
            let plan = parser.plan_source(&source, None)?;
            println!(
                "{} {} files discovered, {} planned, {} failed",
                "ok".green(),
                plan.metrics.files_discovered,
                plan.entries.len(),
                plan.metrics.files_failed
            );
            for entry in &plan.entries {
                println!(
                    "  {}  {} ({})",
                    entry.relative_path.display(),
                    entry.handler.name,
                    entry.selection.resolved_via
                );
            }
            for warning in &plan.warnings {
                println!("  {} {warning}", "warn".yellow());
            }
            for error in &plan.errors {
                println!("  {} {error}", "error".red());
            }
        }
        ParserCommand::Parse {
            source,
            scope,
            batch_ref,
        } => {
            let db = DbLifecycleService::new(paths.clone(), config)?;
            let scope = parser.normalize_scope(&source, &scope)?;
            let run = parser.parse_source(&db, &source, scope.as_ref(), batch_ref.as_deref())?;
            println!(
                "{} batch {} status={} parsed={} reused={} chunks+={} chunks~={}",
                "ok".green(),
                run.batch_id.as_deref().unwrap_or("-"),
                run.status,
                run.metrics.files_parsed,
                run.metrics.files_reused,
                run.metrics.chunks_emitted,
                run.metrics.chunks_reused
            );
            for warning in &run.warnings {
                println!("  {} {warning}", "warn".yellow());
            }
            for error in &run.errors {
                println!("  {} {error}", "error".red());
            }
        }
        ParserCommand::Info { source } => {
            let state = parser.load_manifest_state(&source)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&state).unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn run_checkhealth(paths: &WorkspacePaths, config: &AppConfig) -> Result<(), RagmillError> {
    paths.ensure_layout()?;
    let handle = crate::core::config::WorkspaceHandle {
        paths: paths.clone(),
        config: config.clone(),
    };

    let mut modules = std::collections::BTreeMap::new();
    modules.insert("db".to_string(), db_health_hook(&handle));
    modules.insert("parser".to_string(), parser_health_hook(&handle));

    for (module, reports) in &modules {
        for report in reports {
            let status = match report.status {
                crate::core::health::HealthStatus::Ok => report.status.to_string().green(),
                crate::core::health::HealthStatus::Unknown => report.status.to_string().normal(),
                crate::core::health::HealthStatus::Degraded => report.status.to_string().yellow(),
                crate::core::health::HealthStatus::Error => report.status.to_string().red(),
            };
            println!(
                "{module}/{}: {status} {}",
                report.name,
                report.summary.as_deref().unwrap_or("")
            );
            for action in &report.actions {
                println!("    -> {action}");
            }
        }
    }

    let written = write_health_document(paths, &modules, now_utc())?;
    println!("{} health document at {}", "ok".green(), written.display());
    Ok(())
}
