//! Health evaluation for per-source databases.
//!
//! The evaluator opens each database read-only, recomputes the ledger
//! checksum from the applied set, and compares observed state against the
//! manifest mirror. Severity follows the monotone promotion rule
//! `ok < unknown < degraded < error`; every issue carries at least one
//! concrete remediation action.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use time::{Duration, OffsetDateTime};

use crate::core::config::{DbSettings, WorkspaceHandle, DB_MODULE_KEY};
use crate::core::health::{HealthReport, HealthStatus};
use crate::core::time::{now_utc, parse_rfc3339};
use crate::modules::db::DbManifestState;
use crate::modules::manifest::ManifestService;
use crate::modules::migrations::MigrationRunner;

/// Snapshot of on-disk database state for health comparisons.
#[derive(Debug, Clone)]
struct ObservedState {
    bootstrap_shortuuid7: String,
    head_migration_uuid7: String,
    head_migration_shortuuid7: String,
    ledger_checksum: String,
    pending_migrations: Vec<String>,
    last_vacuum_at: Option<OffsetDateTime>,
}

struct InspectionError {
    message: String,
    actions: Vec<String>,
}

fn inspect_database(
    db_path: &Path,
    runner: &MigrationRunner,
) -> Result<ObservedState, InspectionError> {
    if !db_path.exists() {
        return Err(InspectionError {
            message: format!("Database missing at {}", db_path.display()),
            actions: vec![
                "Run `ragmill db ensure <source>` to bootstrap the database.".to_string(),
            ],
        });
    }

    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
        |err| InspectionError {
            message: format!("Failed to open database {}: {err}", db_path.display()),
            actions: vec![
                "Inspect permissions or recreate the database via ensure.".to_string(),
            ],
        },
    )?;

    let meta = conn
        .query_row(
            "SELECT bootstrap_shortuuid7, head_migration_uuid7,
                    head_migration_shortuuid7, ledger_checksum, last_vacuum_at
             FROM schema_meta WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|_| InspectionError {
            message: "Database schema metadata missing".to_string(),
            actions: vec![
                "Run `ragmill db ensure <source>` to initialize schema.".to_string(),
            ],
        })?
        .ok_or_else(|| InspectionError {
            message: "Database schema metadata not initialized".to_string(),
            actions: vec![
                "Run `ragmill db ensure <source>` to initialize schema.".to_string(),
            ],
        })?;

    let mut latest: Vec<(String, String)> = Vec::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT shortuuid7, direction FROM schema_migrations ORDER BY applied_at, rowid",
            )
            .map_err(|err| InspectionError {
                message: format!("Failed reading migration ledger: {err}"),
                actions: vec![
                    "Run `ragmill db ensure <source>` to initialize schema.".to_string(),
                ],
            })?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| InspectionError {
                message: format!("Failed reading migration ledger: {err}"),
                actions: vec![
                    "Run `ragmill db ensure <source>` to initialize schema.".to_string(),
                ],
            })?;
        for row in rows {
            let (short, direction) = row.map_err(|err| InspectionError {
                message: format!("Failed reading migration ledger: {err}"),
                actions: Vec::new(),
            })?;
            latest.retain(|(existing, _)| existing != &short);
            latest.push((short, direction));
        }
    }

    for (short, _) in &latest {
        if runner.get(short).is_none() {
            return Err(InspectionError {
                message: format!("Unknown migration recorded in ledger: {short}"),
                actions: vec![
                    "Verify packaged migrations match workspace database.".to_string(),
                ],
            });
        }
    }

    let mut applied = Vec::new();
    let mut pending = Vec::new();
    for migration in runner.list_all() {
        let is_applied = latest
            .iter()
            .any(|(short, direction)| short == &migration.short && direction == "up");
        if is_applied {
            applied.push(migration.short.clone());
        } else {
            pending.push(migration.short.clone());
        }
    }

    let (bootstrap, head_uuid, head_short, ledger, last_vacuum_at) = meta;
    let expected = runner
        .ledger_checksum(&applied)
        .map_err(|err| InspectionError {
            message: format!("Failed recomputing ledger checksum: {err}"),
            actions: vec![
                "Verify packaged migrations match workspace database.".to_string(),
            ],
        })?;
    if expected != ledger {
        return Err(InspectionError {
            message: "Ledger checksum mismatch detected".to_string(),
            actions: vec![
                "Verify migration files were not modified and rerun \
                 `ragmill db ensure <source>`."
                    .to_string(),
            ],
        });
    }

    Ok(ObservedState {
        bootstrap_shortuuid7: bootstrap,
        head_migration_uuid7: head_uuid,
        head_migration_shortuuid7: head_short,
        ledger_checksum: ledger,
        pending_migrations: pending,
        last_vacuum_at: last_vacuum_at.and_then(|text| parse_rfc3339(&text).ok()),
    })
}

fn within_drift_window(
    state: &DbManifestState,
    now: OffsetDateTime,
    threshold_seconds: i64,
) -> bool {
    if threshold_seconds <= 0 {
        return false;
    }
    match state.last_ensure_at {
        Some(last_ensure) => now - last_ensure <= Duration::seconds(threshold_seconds),
        None => false,
    }
}

/// Evaluate one source database against manifest + migration ledger.
pub fn evaluate_source(
    name: &str,
    handle: &WorkspaceHandle,
    manifest_service: &ManifestService,
    runner: &MigrationRunner,
    settings: &DbSettings,
    now: OffsetDateTime,
) -> HealthReport {
    let ensure_action = format!("Run `ragmill db ensure {name}` to regenerate the manifest entry.");

    let snapshot = match manifest_service.load(name, false, false) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return HealthReport::new(name, HealthStatus::Error)
                .with_summary(format!("Failed to read manifest: {err}"))
                .with_actions(vec![ensure_action]);
        }
    };

    let Some(payload) = snapshot.module(DB_MODULE_KEY) else {
        return HealthReport::new(name, HealthStatus::Error)
            .with_summary("Database manifest entry missing.")
            .with_actions(vec![ensure_action]);
    };
    let manifest_state = DbManifestState::from_map(Some(payload));

    let observed = match inspect_database(&handle.paths.source_database_path(name), runner) {
        Ok(observed) => observed,
        Err(err) => {
            let actions: Vec<String> = if err.actions.is_empty() {
                vec![ensure_action]
            } else {
                err.actions
                    .into_iter()
                    .map(|action| action.replace("<source>", name))
                    .collect()
            };
            return HealthReport::new(name, HealthStatus::Error)
                .with_summary(err.message)
                .with_actions(actions)
                .with_last_refresh(manifest_state.last_ensure_at);
        }
    };

    let mut status = HealthStatus::Ok;
    let mut issues: Vec<String> = Vec::new();
    let mut actions: Vec<String> = Vec::new();
    let mut add_action = |actions: &mut Vec<String>, action: String| {
        if !actions.contains(&action) {
            actions.push(action);
        }
    };

    if !observed.pending_migrations.is_empty() {
        status = status.elevate(HealthStatus::Degraded);
        issues.push(format!(
            "pending migrations: {}",
            observed.pending_migrations.join(", ")
        ));
        add_action(
            &mut actions,
            format!("Run `ragmill db upgrade {name}` to apply migrations."),
        );
    }

    if manifest_state.pending_migrations != observed.pending_migrations
        && !within_drift_window(&manifest_state, now, settings.drift_warning_seconds)
    {
        status = status.elevate(HealthStatus::Degraded);
        issues.push("manifest pending migrations out of sync".to_string());
        add_action(
            &mut actions,
            format!("Run `ragmill db ensure {name}` to resync manifest metadata."),
        );
    }

    let mut drift_components: Vec<&str> = Vec::new();
    if manifest_state.head_migration_shortuuid7.as_deref()
        != Some(observed.head_migration_shortuuid7.as_str())
    {
        drift_components.push("head migration");
    }
    if manifest_state.head_migration_uuid7.as_deref()
        != Some(observed.head_migration_uuid7.as_str())
    {
        drift_components.push("head migration UUID");
    }
    if let Some(bootstrap) = &manifest_state.bootstrap_shortuuid7 {
        if bootstrap != &observed.bootstrap_shortuuid7 {
            drift_components.push("bootstrap identifier");
        }
    }
    if let Some(ledger) = &manifest_state.ledger_checksum {
        if ledger != &observed.ledger_checksum {
            drift_components.push("ledger checksum");
        }
    }
    if !drift_components.is_empty()
        && !within_drift_window(&manifest_state, now, settings.drift_warning_seconds)
    {
        status = status.elevate(HealthStatus::Degraded);
        issues.push(format!(
            "manifest drift detected ({})",
            drift_components.join(", ")
        ));
        add_action(
            &mut actions,
            format!("Run `ragmill db ensure {name}` to refresh manifest metadata."),
        );
    }

    if settings.vacuum_max_stale_days >= 0 {
        let stale_limit = Duration::days(settings.vacuum_max_stale_days);
        match observed.last_vacuum_at {
            None => {
                status = status.elevate(HealthStatus::Degraded);
                issues.push("vacuum has never been executed".to_string());
                add_action(
                    &mut actions,
                    format!("Run `ragmill db vacuum {name}` to perform maintenance."),
                );
            }
            Some(last_vacuum) if now - last_vacuum > stale_limit => {
                status = status.elevate(HealthStatus::Degraded);
                let stale_days = (now - last_vacuum).whole_days();
                issues.push(format!(
                    "vacuum stale ({stale_days} days since last maintenance)"
                ));
                add_action(
                    &mut actions,
                    format!("Run `ragmill db vacuum {name}` to perform maintenance."),
                );
            }
            Some(_) => {}
        }
    }

    let summary = if issues.is_empty() {
        "database healthy".to_string()
    } else {
        issues.join(", ")
    };
    actions.sort();

    HealthReport::new(name, status)
        .with_summary(summary)
        .with_actions(actions)
        .with_last_refresh(manifest_state.last_ensure_at)
}

/// Evaluate health for each configured source database.
pub fn db_health_hook(handle: &WorkspaceHandle) -> Vec<HealthReport> {
    if !handle.config.module_enabled(DB_MODULE_KEY) {
        return vec![HealthReport::new("db-module", HealthStatus::Unknown)
            .with_summary("Database module disabled via configuration.")
            .with_actions(vec![
                "Set `modules.db.enabled = true` in ragmill.toml to enable checks.".to_string(),
            ])];
    }

    let runner = match MigrationRunner::resolve(&handle.config.db.migrations_path) {
        Ok(runner) => runner,
        Err(err) => {
            return vec![HealthReport::new("migrations", HealthStatus::Error)
                .with_summary(format!("Failed to load migrations: {err}"))
                .with_actions(vec![
                    "Verify packaged SQL migrations are present and reinstall ragmill."
                        .to_string(),
                ])];
        }
    };

    let manifest_service =
        ManifestService::new(handle.paths.clone(), handle.config.manifest.clone());
    let now = now_utc();

    handle
        .config
        .iter_sources()
        .map(|(name, _)| {
            evaluate_source(
                name,
                handle,
                &manifest_service,
                &runner,
                &handle.config.db,
                now,
            )
        })
        .collect()
}
