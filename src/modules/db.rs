//! Database lifecycle orchestration for per-source SQLite stores.
//!
//! Every operation serializes on the per-source DB lock
//! (`.locks/db/<slug>.lock`), then mirrors the backend outcome into the
//! source manifest inside a manifest transaction. The service owns the
//! `last_ensure_at` / `last_vacuum_at` timestamps; everything else comes
//! from the backend.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::core::config::{AppConfig, Concurrency, DbSettings};
use crate::core::error::RagmillError;
use crate::core::lock::FileLock;
use crate::core::paths::WorkspacePaths;
use crate::core::time::{now_utc, parse_rfc3339, to_rfc3339};
use crate::modules::db_backend::{build_default_backend, DbLifecycleBackend};
use crate::modules::manifest::ManifestService;
use crate::modules::manifest_migrator::MODULES_VERSION;

/// Canonical snapshot of the `modules.db` manifest payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbManifestState {
    pub bootstrap_shortuuid7: Option<String>,
    pub head_migration_uuid7: Option<String>,
    pub head_migration_shortuuid7: Option<String>,
    pub ledger_checksum: Option<String>,
    pub last_vacuum_at: Option<OffsetDateTime>,
    pub last_ensure_at: Option<OffsetDateTime>,
    pub pending_migrations: Vec<String>,
}

impl DbManifestState {
    pub fn from_map(payload: Option<&Map<String, Value>>) -> Self {
        let Some(payload) = payload else {
            return Self::default();
        };
        let read_string = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let read_datetime = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .and_then(|text| parse_rfc3339(text).ok())
        };
        let pending = payload
            .get("pending_migrations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bootstrap_shortuuid7: read_string("bootstrap_shortuuid7"),
            head_migration_uuid7: read_string("head_migration_uuid7"),
            head_migration_shortuuid7: read_string("head_migration_shortuuid7"),
            ledger_checksum: read_string("ledger_checksum"),
            last_vacuum_at: read_datetime("last_vacuum_at"),
            last_ensure_at: read_datetime("last_ensure_at"),
            pending_migrations: pending,
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let as_value = |value: &Option<String>| match value {
            Some(text) => Value::String(text.clone()),
            None => Value::Null,
        };
        let dt_value = |value: &Option<OffsetDateTime>| match value {
            Some(at) => Value::String(to_rfc3339(*at)),
            None => Value::Null,
        };

        let mut payload = Map::new();
        payload.insert(
            "bootstrap_shortuuid7".to_string(),
            as_value(&self.bootstrap_shortuuid7),
        );
        payload.insert(
            "head_migration_uuid7".to_string(),
            as_value(&self.head_migration_uuid7),
        );
        payload.insert(
            "head_migration_shortuuid7".to_string(),
            as_value(&self.head_migration_shortuuid7),
        );
        payload.insert(
            "ledger_checksum".to_string(),
            as_value(&self.ledger_checksum),
        );
        payload.insert("last_vacuum_at".to_string(), dt_value(&self.last_vacuum_at));
        payload.insert("last_ensure_at".to_string(), dt_value(&self.last_ensure_at));
        payload.insert(
            "pending_migrations".to_string(),
            Value::Array(
                self.pending_migrations
                    .iter()
                    .map(|short| Value::String(short.clone()))
                    .collect(),
            ),
        );
        payload
    }
}

/// Result payload returned from `ensure` operations.
#[derive(Debug, Clone)]
pub struct DbEnsureOutcome {
    pub status: DbManifestState,
    pub applied_migrations: Vec<String>,
}

/// Result payload returned from `upgrade` operations.
#[derive(Debug, Clone)]
pub struct DbUpgradeOutcome {
    pub status: DbManifestState,
    pub applied_migrations: Vec<String>,
}

/// Result payload returned from `downgrade` operations.
#[derive(Debug, Clone)]
pub struct DbDowngradeOutcome {
    pub status: DbManifestState,
    pub rolled_back_migrations: Vec<String>,
}

/// Information returned from `info` operations.
#[derive(Debug, Clone)]
pub struct DbInfoOutcome {
    pub status: DbManifestState,
    pub schema: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Result payload returned from `vacuum` operations.
#[derive(Debug, Clone)]
pub struct DbVacuumOutcome {
    pub status: DbManifestState,
}

/// Result payload returned from `run` operations.
#[derive(Debug, Clone)]
pub struct DbRunOutcome {
    pub status: DbManifestState,
}

/// Result payload returned from `reset` operations.
#[derive(Debug, Clone)]
pub struct DbResetOutcome {
    pub status: DbManifestState,
}

/// Ensure per-source databases exist and mirror state into manifests.
pub struct DbLifecycleService {
    paths: WorkspacePaths,
    manifest: ManifestService,
    settings: DbSettings,
    backend: Box<dyn DbLifecycleBackend>,
    now: fn() -> OffsetDateTime,
}

impl DbLifecycleService {
    pub fn new(paths: WorkspacePaths, config: &AppConfig) -> Result<Self, RagmillError> {
        let backend = build_default_backend(&config.db)?;
        Ok(Self::with_backend(paths, config, backend))
    }

    pub fn with_backend(
        paths: WorkspacePaths,
        config: &AppConfig,
        backend: Box<dyn DbLifecycleBackend>,
    ) -> Self {
        let manifest = ManifestService::new(paths.clone(), config.manifest.clone());
        Self {
            paths,
            manifest,
            settings: config.db.clone(),
            backend,
            now: now_utc,
        }
    }

    pub fn with_clock(mut self, now: fn() -> OffsetDateTime) -> Self {
        self.now = now;
        self
    }

    pub fn manifest_service(&self) -> &ManifestService {
        &self.manifest
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    /// Filesystem lock path for `source` under the configured namespace.
    /// Slashes are sanitized; an empty name maps to the reserved
    /// `workspace` key.
    pub fn lock_path(&self, source: &str) -> PathBuf {
        let mut key = source.trim().to_string();
        if key.is_empty() {
            key = "workspace".to_string();
        }
        key = key.replace(['/', '\\'], "_");
        self.paths
            .locks_dir()
            .join(&self.settings.lock_namespace)
            .join(format!("{key}{}", self.settings.lock_suffix))
    }

    /// Acquire the per-source DB lock, mapping failures to typed errors
    /// that carry the operation and source.
    pub fn lock(&self, source: &str, action: &str) -> Result<FileLock, RagmillError> {
        let path = self.lock_path(source);
        let mut lock = FileLock::new(
            path.clone(),
            self.settings.lock_timeout,
            self.settings.lock_poll_interval,
        );
        match lock.acquire() {
            Ok(()) => Ok(lock),
            Err(RagmillError::LockTimeout(message)) => Err(RagmillError::LockTimeout(format!(
                "db {action} for {source:?}: {message}"
            ))),
            Err(RagmillError::LockError(message)) => Err(RagmillError::LockError(format!(
                "db {action} for {source:?}: {message}"
            ))),
            Err(other) => Err(other),
        }
    }

    /// Ensure `source` has a database and manifest scaffolding.
    pub fn ensure(&self, source: &str) -> Result<PathBuf, RagmillError> {
        let db_path = self.prepare_db_path(source, true)?;
        let ensured_at = (self.now)();
        let _lock = self.lock(source, "ensure")?;

        self.mutate_manifest(source, "ensure", |state| {
            let outcome = self
                .backend
                .ensure(source, &db_path, state, ensured_at)
                .map_err(|err| map_backend_error("ensure", source, err))?;
            let mut status = outcome.status;
            status.last_ensure_at = Some(ensured_at);
            Ok(status)
        })?;
        Ok(db_path)
    }

    /// Apply pending migrations for `source`.
    pub fn upgrade(&self, source: &str, steps: Option<usize>) -> Result<Vec<String>, RagmillError> {
        let db_path = self.prepare_db_path(source, false)?;
        let upgraded_at = (self.now)();
        let _lock = self.lock(source, "upgrade")?;

        let mut applied = Vec::new();
        self.mutate_manifest(source, "upgrade", |state| {
            let outcome = self
                .backend
                .upgrade(source, &db_path, state, steps, upgraded_at)
                .map_err(|err| map_backend_error("upgrade", source, err))?;
            applied = outcome.applied_migrations.clone();
            Ok(outcome.status)
        })?;
        Ok(applied)
    }

    /// Roll back migrations for `source`. Destructive.
    pub fn downgrade(&self, source: &str, steps: usize) -> Result<Vec<String>, RagmillError> {
        let db_path = self.prepare_db_path(source, false)?;
        let downgraded_at = (self.now)();
        let _lock = self.lock(source, "downgrade")?;

        let mut rolled_back = Vec::new();
        self.mutate_manifest(source, "downgrade", |state| {
            let outcome = self
                .backend
                .downgrade(source, &db_path, state, steps, downgraded_at)
                .map_err(|err| map_backend_error("downgrade", source, err))?;
            rolled_back = outcome.rolled_back_migrations.clone();
            Ok(outcome.status)
        })?;
        Ok(rolled_back)
    }

    /// Return manifest/database info for `source`.
    pub fn info(
        &self,
        source: &str,
        include_schema: bool,
        include_counts: bool,
    ) -> Result<Value, RagmillError> {
        let db_path = self.prepare_db_path(source, false)?;
        let inspected_at = (self.now)();
        let _lock = self.lock(source, "info")?;

        let mut info_outcome: Option<DbInfoOutcome> = None;
        let state = self.mutate_manifest(source, "info", |state| {
            let outcome = self
                .backend
                .info(
                    source,
                    &db_path,
                    state,
                    include_schema,
                    include_counts,
                    inspected_at,
                )
                .map_err(|err| map_backend_error("info", source, err))?;
            let status = outcome.status.clone();
            info_outcome = Some(outcome);
            Ok(status)
        })?;

        let outcome =
            info_outcome.ok_or_else(|| RagmillError::DbLifecycle("info outcome missing".into()))?;

        let mut payload = Map::new();
        payload.insert("source".to_string(), Value::String(source.to_string()));
        payload.insert(
            "database".to_string(),
            Value::String(db_path.to_string_lossy().to_string()),
        );
        payload.insert("manifest".to_string(), Value::Object(state.to_map()));
        if include_schema {
            if let Some(schema) = outcome.schema {
                payload.insert("schema".to_string(), Value::String(schema));
            }
        }

        let mut metadata = outcome.metadata;
        let table_counts = metadata.remove("table_counts");
        let skipped = metadata.remove("table_counts_skipped");
        if !metadata.is_empty() {
            payload.insert("metadata".to_string(), Value::Object(metadata));
        }
        if let Some(counts) = table_counts {
            payload.insert("table_counts".to_string(), counts);
        }
        if let Some(skipped) = skipped {
            let entries = match &skipped {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            if !entries.is_empty() {
                let mut summary: Map<String, Value> = Map::new();
                for entry in &entries {
                    let reason = entry
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let count = summary.get(&reason).and_then(Value::as_i64).unwrap_or(0);
                    summary.insert(reason, Value::Number((count + 1).into()));
                }
                payload.insert("table_counts_skipped".to_string(), Value::Array(entries));
                payload.insert(
                    "table_counts_skipped_summary".to_string(),
                    Value::Object(summary),
                );
            }
        }
        Ok(Value::Object(payload))
    }

    /// Perform vacuum maintenance for `source`.
    pub fn vacuum(&self, source: &str, concurrency: Option<Concurrency>) -> Result<(), RagmillError> {
        let db_path = self.prepare_db_path(source, false)?;
        let vacuumed_at = (self.now)();
        let _lock = self.lock(source, "vacuum")?;

        self.mutate_manifest(source, "vacuum", |state| {
            let outcome = self
                .backend
                .vacuum(source, &db_path, state, concurrency, vacuumed_at)
                .map_err(|err| map_backend_error("vacuum", source, err))?;
            let mut status = outcome.status;
            status.last_vacuum_at = Some(vacuumed_at);
            Ok(status)
        })?;
        Ok(())
    }

    /// Execute manual SQL for `source`.
    ///
    /// A missing script is a lifecycle error raised before any lock is
    /// taken; `run_allow_outside = false` additionally rejects scripts
    /// outside the workspace subtree.
    pub fn run(&self, source: &str, sql_path: &Path, autocommit: bool) -> Result<(), RagmillError> {
        if !sql_path.exists() {
            return Err(RagmillError::DbLifecycle(format!(
                "SQL script not found for {source}: {}",
                sql_path.display()
            )));
        }
        if !self.settings.run_allow_outside {
            crate::core::source::ensure_workspace_path(&self.paths.workspace, sql_path).map_err(
                |_| {
                    RagmillError::DbLifecycle(format!(
                        "SQL script {} is outside the workspace and run_allow_outside is disabled",
                        sql_path.display()
                    ))
                },
            )?;
        }

        let db_path = self.prepare_db_path(source, false)?;
        let executed_at = (self.now)();
        let _lock = self.lock(source, "run")?;

        self.mutate_manifest(source, "run", |state| {
            let outcome = self
                .backend
                .run(source, &db_path, state, sql_path, autocommit, executed_at)
                .map_err(|err| map_backend_error("run", source, err))?;
            Ok(outcome.status)
        })?;
        Ok(())
    }

    /// Reset the database for `source`. Destructive; requires `force`.
    pub fn reset(&self, source: &str, force: bool) -> Result<(), RagmillError> {
        if !force {
            return Err(RagmillError::DbLifecycle(format!(
                "reset for {source} is destructive; pass force to proceed"
            )));
        }

        let db_path = self.prepare_db_path(source, false)?;
        let reset_at = (self.now)();
        let _lock = self.lock(source, "reset")?;

        self.mutate_manifest(source, "reset", |state| {
            let outcome = self
                .backend
                .reset(source, &db_path, state, force, reset_at)
                .map_err(|err| map_backend_error("reset", source, err))?;
            let mut status = outcome.status;
            status.last_ensure_at = Some(reset_at);
            Ok(status)
        })?;
        Ok(())
    }

    fn prepare_db_path(&self, source: &str, touch: bool) -> Result<PathBuf, RagmillError> {
        let path = self.paths.source_database_path(source);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if touch && !path.exists() {
            std::fs::File::create(&path)?;
        }
        Ok(path)
    }

    fn mutate_manifest(
        &self,
        source: &str,
        operation: &str,
        mutator: impl FnOnce(&DbManifestState) -> Result<DbManifestState, RagmillError>,
    ) -> Result<DbManifestState, RagmillError> {
        let db_module_key = self.manifest.settings().db_module_key.clone();
        let result = self.manifest.with_transaction(source, true, |txn| {
            let payload = txn.snapshot.ensure_module(&db_module_key).clone();
            let current = DbManifestState::from_map(Some(&payload));
            let updated = mutator(&current)?;
            let module = txn.snapshot.ensure_module(&db_module_key);
            for (key, value) in updated.to_map() {
                module.insert(key, value);
            }
            txn.snapshot.set_modules_version(MODULES_VERSION);
            Ok(updated)
        });
        result.map_err(|err| match err {
            RagmillError::ManifestRead(_)
            | RagmillError::ManifestWrite(_)
            | RagmillError::ManifestTransaction(_)
            | RagmillError::ManifestBackup(_) => RagmillError::DbManifestSync(format!(
                "{operation} manifest sync failed for {source}: {err}"
            )),
            other => other,
        })
    }
}

fn map_backend_error(action: &str, source: &str, err: RagmillError) -> RagmillError {
    match err {
        RagmillError::DbLifecycle(_)
        | RagmillError::DbOperation(_)
        | RagmillError::DbManifestSync(_)
        | RagmillError::MigrationLoad(_)
        | RagmillError::NotImplemented(_) => err,
        other => RagmillError::DbOperation(format!("{action} failed for {source}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_round_trip() {
        let mut state = DbManifestState::default();
        state.bootstrap_shortuuid7 = Some("06801HWW01TV".to_string());
        state.pending_migrations = vec!["06801M63R1ST".to_string()];
        let map = state.to_map();
        let parsed = DbManifestState::from_map(Some(&map));
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_state_tolerates_junk_payload() {
        let payload = json!({
            "bootstrap_shortuuid7": 42,
            "pending_migrations": "nope",
        });
        let state = DbManifestState::from_map(payload.as_object());
        assert!(state.bootstrap_shortuuid7.is_none());
        assert!(state.pending_migrations.is_empty());
    }
}
