//! Per-source manifest reads, writes, and migrations.
//!
//! Manifests are JSON documents serialized with sorted keys and 2-space
//! indentation. Writers hold a sibling file lock, stage to a temp file in
//! the same directory, fsync, then rename; a timestamped backup is rotated
//! before the replace when backups are enabled. Snapshots handed to callers
//! are deep copies: mutating one never affects a later `load`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::core::config::ManifestSettings;
use crate::core::error::RagmillError;
use crate::core::lock::{build_lock_path, FileLock};
use crate::core::paths::WorkspacePaths;
use crate::core::source::SourceRef;
use crate::core::time::{backup_label, now_utc};
use crate::modules::manifest_migrator::ManifestMigrator;

/// Checksum over the compact sorted serialization of a manifest document.
pub fn compute_checksum(payload: &Value) -> String {
    let serialized = serde_json::to_string(payload).unwrap_or_default();
    let mut digest = Sha256::new();
    digest.update(serialized.as_bytes());
    format!("{:x}", digest.finalize())
}

fn serialize_manifest(payload: &Value) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string())
}

/// In-memory representation of a manifest document.
#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    pub source: SourceRef,
    pub data: Value,
    pub modules_key: String,
    pub db_module_key: String,
}

impl ManifestSnapshot {
    pub fn checksum(&self) -> String {
        compute_checksum(&self.data)
    }

    /// Ensure the modules namespace exists and return it.
    pub fn ensure_modules(&mut self) -> &mut serde_json::Map<String, Value> {
        if !self.data.is_object() {
            self.data = Value::Object(serde_json::Map::new());
        }
        let root = self.data.as_object_mut().expect("object ensured above");
        if !root
            .get(&self.modules_key)
            .map(Value::is_object)
            .unwrap_or(false)
        {
            root.insert(self.modules_key.clone(), Value::Object(serde_json::Map::new()));
        }
        root.get_mut(&self.modules_key)
            .and_then(Value::as_object_mut)
            .expect("modules namespace ensured above")
    }

    /// Ensure `modules.<module>` exists and return it.
    pub fn ensure_module(&mut self, module: &str) -> &mut serde_json::Map<String, Value> {
        let modules = self.ensure_modules();
        if !modules.get(module).map(Value::is_object).unwrap_or(false) {
            modules.insert(module.to_string(), Value::Object(serde_json::Map::new()));
        }
        modules
            .get_mut(module)
            .and_then(Value::as_object_mut)
            .expect("module payload ensured above")
    }

    pub fn module(&self, module: &str) -> Option<&serde_json::Map<String, Value>> {
        self.data
            .get(&self.modules_key)?
            .as_object()?
            .get(module)?
            .as_object()
    }

    pub fn set_modules_version(&mut self, version: i64) {
        if let Some(root) = self.data.as_object_mut() {
            root.insert("modules_version".to_string(), Value::Number(version.into()));
        }
    }
}

type TxnCallback = Box<dyn FnOnce(&ManifestSnapshot)>;

/// Transactional manifest write context.
///
/// State machine: body runs against the snapshot; on body error rollback
/// callbacks run in LIFO order and the error re-raises; on persistence
/// error rollbacks run and the error is wrapped as a transaction error; on
/// success commit callbacks run in registration order.
pub struct ManifestTransaction {
    pub snapshot: ManifestSnapshot,
    baseline_checksum: String,
    on_commit: Vec<TxnCallback>,
    on_rollback: Vec<TxnCallback>,
}

impl ManifestTransaction {
    pub fn on_commit(&mut self, callback: impl FnOnce(&ManifestSnapshot) + 'static) {
        self.on_commit.push(Box::new(callback));
    }

    pub fn on_rollback(&mut self, callback: impl FnOnce(&ManifestSnapshot) + 'static) {
        self.on_rollback.push(Box::new(callback));
    }

    fn run_commit(&mut self) {
        for callback in self.on_commit.drain(..) {
            callback(&self.snapshot);
        }
    }

    fn run_rollback(&mut self) {
        for callback in self.on_rollback.drain(..).rev() {
            callback(&self.snapshot);
        }
    }
}

/// High-level API for manifest reads, writes, and migrations.
pub struct ManifestService {
    paths: WorkspacePaths,
    settings: ManifestSettings,
    migrator: ManifestMigrator,
    now: fn() -> OffsetDateTime,
}

impl ManifestService {
    pub fn new(paths: WorkspacePaths, settings: ManifestSettings) -> Self {
        let migrator = ManifestMigrator::new(&settings.modules_key, &settings.db_module_key);
        Self {
            paths,
            settings,
            migrator,
            now: now_utc,
        }
    }

    /// Override the clock (tests pin backup timestamps).
    pub fn with_clock(mut self, now: fn() -> OffsetDateTime) -> Self {
        self.now = now;
        self
    }

    pub fn settings(&self) -> &ManifestSettings {
        &self.settings
    }

    pub fn resolve(&self, name: &str) -> SourceRef {
        SourceRef::from_workspace(&self.paths, name)
    }

    /// Load the manifest for `source` into memory.
    ///
    /// Missing or whitespace-only files load as `{}`. With
    /// `apply_migrations`, the manifest lock is held while the migrator
    /// runs; changes persist with a backup unless `dry_run`.
    pub fn load(
        &self,
        source: &str,
        apply_migrations: bool,
        dry_run: bool,
    ) -> Result<ManifestSnapshot, RagmillError> {
        let source_ref = self.resolve(source);
        let data = if apply_migrations {
            let mut lock = self.build_lock(&source_ref);
            lock.acquire().map_err(map_lock_error)?;
            let data = self.read_manifest(&source_ref)?;
            let result = self.migrator.migrate(&data);
            if result.applied && !dry_run {
                self.persist(&source_ref, &result.data, true)?;
            }
            result.data
        } else {
            self.read_manifest(&source_ref)?
        };

        Ok(ManifestSnapshot {
            source: source_ref,
            data,
            modules_key: self.settings.modules_key.clone(),
            db_module_key: self.settings.db_module_key.clone(),
        })
    }

    /// Read-modify-write under the manifest lock. The document is persisted
    /// only when `mutate` changed its checksum.
    pub fn write(
        &self,
        source: &str,
        mutate: impl FnOnce(&mut ManifestSnapshot) -> Result<(), RagmillError>,
    ) -> Result<ManifestSnapshot, RagmillError> {
        let source_ref = self.resolve(source);
        let mut lock = self.build_lock(&source_ref);
        lock.acquire().map_err(map_lock_error)?;

        let baseline = self.read_manifest(&source_ref)?;
        let baseline_checksum = compute_checksum(&baseline);
        let mut snapshot = ManifestSnapshot {
            source: source_ref.clone(),
            data: baseline,
            modules_key: self.settings.modules_key.clone(),
            db_module_key: self.settings.db_module_key.clone(),
        };

        mutate(&mut snapshot)?;

        if snapshot.checksum() != baseline_checksum {
            self.persist(&source_ref, &snapshot.data, true)?;
        }
        Ok(snapshot)
    }

    /// Same locking and atomic-replace guarantees as `write`, with commit
    /// and rollback hooks.
    pub fn with_transaction<R>(
        &self,
        source: &str,
        backup: bool,
        body: impl FnOnce(&mut ManifestTransaction) -> Result<R, RagmillError>,
    ) -> Result<R, RagmillError> {
        let source_ref = self.resolve(source);
        let mut lock = self.build_lock(&source_ref);
        lock.acquire().map_err(map_lock_error)?;

        let baseline = self.read_manifest(&source_ref)?;
        let baseline_checksum = compute_checksum(&baseline);
        let mut txn = ManifestTransaction {
            snapshot: ManifestSnapshot {
                source: source_ref.clone(),
                data: baseline,
                modules_key: self.settings.modules_key.clone(),
                db_module_key: self.settings.db_module_key.clone(),
            },
            baseline_checksum,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        };

        let outcome = match body(&mut txn) {
            Ok(outcome) => outcome,
            Err(err) => {
                txn.run_rollback();
                return Err(err);
            }
        };

        if txn.snapshot.checksum() != txn.baseline_checksum {
            if let Err(err) = self.persist(&source_ref, &txn.snapshot.data, backup) {
                txn.run_rollback();
                return Err(RagmillError::ManifestTransaction(format!(
                    "Manifest transaction failed for {}: {err}",
                    source_ref.name
                )));
            }
        }
        txn.run_commit();
        Ok(outcome)
    }

    /// Trigger a manifest migration, returning `true` when applied.
    pub fn migrate(&self, source: &str, dry_run: bool) -> Result<bool, RagmillError> {
        let source_ref = self.resolve(source);
        let mut lock = self.build_lock(&source_ref);
        lock.acquire().map_err(map_lock_error)?;

        let data = self.read_manifest(&source_ref)?;
        let result = self.migrator.migrate(&data);
        if result.applied && !dry_run {
            self.persist(&source_ref, &result.data, true)?;
        }
        Ok(result.applied)
    }

    fn build_lock(&self, source: &SourceRef) -> FileLock {
        FileLock::new(
            build_lock_path(&source.manifest_path, &self.settings.lock_suffix),
            self.settings.lock_timeout,
            self.settings.lock_poll_interval,
        )
    }

    fn read_manifest(&self, source: &SourceRef) -> Result<Value, RagmillError> {
        let path = &source.manifest_path;
        if !path.exists() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let text = fs::read_to_string(path).map_err(|err| {
            RagmillError::ManifestRead(format!(
                "Failed to read manifest at {}: {err}",
                path.display()
            ))
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let payload: Value = serde_json::from_str(&text).map_err(|err| {
            RagmillError::ManifestRead(format!("Malformed manifest at {}: {err}", path.display()))
        })?;
        if !payload.is_object() {
            return Err(RagmillError::ManifestRead(format!(
                "Manifest at {} is not a JSON object",
                path.display()
            )));
        }
        Ok(payload)
    }

    fn persist(&self, source: &SourceRef, data: &Value, backup: bool) -> Result<(), RagmillError> {
        source.ensure_directories()?;
        let path = &source.manifest_path;

        if backup && self.settings.backups_enabled {
            create_backup(
                path,
                &self.settings.backup_suffix,
                self.settings.backup_retention,
                (self.now)(),
            )
            .map_err(|err| {
                RagmillError::ManifestWrite(format!(
                    "Failed backing up manifest for {}: {err}",
                    source.name
                ))
            })?;
        }

        let payload = serialize_manifest(data);
        let staging = path.with_file_name(format!(
            ".{}.tmp-{}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            std::process::id()
        ));
        let stage_result = (|| -> std::io::Result<()> {
            let mut file = File::create(&staging)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(err) = stage_result {
            let _ = fs::remove_file(&staging);
            return Err(RagmillError::ManifestWrite(format!(
                "Failed staging manifest for {}: {err}",
                source.name
            )));
        }

        if let Err(err) = fs::rename(&staging, path) {
            let _ = fs::remove_file(&staging);
            return Err(RagmillError::ManifestWrite(format!(
                "Failed writing manifest for {}: {err}",
                source.name
            )));
        }
        Ok(())
    }
}

fn map_lock_error(err: RagmillError) -> RagmillError {
    match err {
        RagmillError::LockTimeout(message) => {
            RagmillError::LockTimeout(format!("manifest: {message}"))
        }
        RagmillError::LockError(message) => RagmillError::LockError(format!("manifest: {message}")),
        other => other,
    }
}

/// Create a timestamped backup for `manifest_path` if it exists, then prune
/// old backups keeping the newest `retention` entries.
pub fn create_backup(
    manifest_path: &Path,
    suffix: &str,
    retention: usize,
    timestamp: OffsetDateTime,
) -> Result<Option<PathBuf>, RagmillError> {
    if retention == 0 || !manifest_path.exists() {
        return Ok(None);
    }

    let name = manifest_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let backup_name = format!("{name}.{}{suffix}", backup_label(timestamp));
    let destination = manifest_path.with_file_name(&backup_name);
    fs::copy(manifest_path, &destination).map_err(|err| {
        RagmillError::ManifestBackup(format!(
            "Failed creating manifest backup at {}: {err}",
            destination.display()
        ))
    })?;

    prune_backups(manifest_path, suffix, retention)?;
    Ok(Some(destination))
}

/// Remove old backups, keeping the newest `retention` entries by mtime
/// (ties broken by name).
pub fn prune_backups(
    manifest_path: &Path,
    suffix: &str,
    retention: usize,
) -> Result<(), RagmillError> {
    if retention == 0 {
        return Ok(());
    }
    let Some(parent) = manifest_path.parent() else {
        return Ok(());
    };
    let name = manifest_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let prefix = format!("{name}.");

    let mut backups: Vec<(i128, String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.starts_with(&prefix) || !file_name.ends_with(suffix) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|value| {
                value
                    .duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_nanos() as i128)
            })
            .unwrap_or(0);
        backups.push((mtime, file_name, entry.path()));
    }

    backups.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    if backups.len() <= retention {
        return Ok(());
    }
    let excess = backups.len() - retention;
    for (_, _, path) in backups.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(RagmillError::ManifestBackup(format!(
                    "Failed pruning manifest backup {}: {err}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

