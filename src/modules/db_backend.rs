//! Lifecycle backends: the SQLite implementation and a null placeholder.
//!
//! The backend executes migration SQL inside explicit transactions, appends
//! to the `schema_migrations` ledger, and keeps `schema_meta` pointing at
//! the head migration with a recomputed ledger checksum.

use std::fs;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::core::config::{Concurrency, DbSettings};
use crate::core::error::RagmillError;
use crate::core::time::{parse_rfc3339, to_rfc3339};
use crate::modules::db::{
    DbDowngradeOutcome, DbEnsureOutcome, DbInfoOutcome, DbManifestState, DbResetOutcome,
    DbRunOutcome, DbUpgradeOutcome, DbVacuumOutcome,
};
use crate::modules::migrations::{normalize_sql, Migration, MigrationRunner};

/// Backend interface coordinating concrete SQLite operations.
///
/// A null backend that returns state unchanged is acceptable as a
/// boot-time placeholder, but production wiring must use the SQLite
/// implementation: `ensure` must never leave `schema_meta` uninitialized.
pub trait DbLifecycleBackend: Send + Sync {
    fn ensure(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        now: OffsetDateTime,
    ) -> Result<DbEnsureOutcome, RagmillError>;

    fn upgrade(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        steps: Option<usize>,
        now: OffsetDateTime,
    ) -> Result<DbUpgradeOutcome, RagmillError>;

    fn downgrade(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        steps: usize,
        now: OffsetDateTime,
    ) -> Result<DbDowngradeOutcome, RagmillError>;

    fn info(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        include_schema: bool,
        include_counts: bool,
        now: OffsetDateTime,
    ) -> Result<DbInfoOutcome, RagmillError>;

    fn vacuum(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        concurrency: Option<Concurrency>,
        now: OffsetDateTime,
    ) -> Result<DbVacuumOutcome, RagmillError>;

    fn run(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        sql_path: &Path,
        autocommit: bool,
        now: OffsetDateTime,
    ) -> Result<DbRunOutcome, RagmillError>;

    fn reset(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        force: bool,
        now: OffsetDateTime,
    ) -> Result<DbResetOutcome, RagmillError>;
}

/// Establish a SQLite connection with ragmill's standard configuration:
/// WAL journal mode, foreign keys on, 5-second busy timeout.
pub fn db_connect(db_path: &Path) -> Result<Connection, RagmillError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Real backend executing packaged migrations against SQLite.
pub struct SqliteLifecycleBackend {
    runner: MigrationRunner,
    ensure_auto_upgrade: bool,
    info_count_row_limit: u64,
}

impl SqliteLifecycleBackend {
    pub fn new(runner: MigrationRunner, settings: &DbSettings) -> Self {
        Self {
            runner,
            ensure_auto_upgrade: settings.ensure_auto_upgrade,
            info_count_row_limit: settings.info_count_row_limit,
        }
    }

    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }

    fn schema_present(&self, conn: &Connection) -> Result<bool, RagmillError> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Applied shorts in canonical catalog order. The ledger is an append
    /// log; the last row per short decides its direction.
    fn applied_shorts(&self, conn: &Connection) -> Result<Vec<String>, RagmillError> {
        let mut latest: Map<String, Value> = Map::new();
        let mut stmt = conn.prepare(
            "SELECT shortuuid7, direction FROM schema_migrations ORDER BY applied_at, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (short, direction) = row?;
            latest.insert(short, Value::String(direction));
        }

        let mut applied = Vec::new();
        for migration in self.runner.list_all() {
            if latest.get(&migration.short).and_then(Value::as_str) == Some("up") {
                applied.push(migration.short.clone());
            }
        }
        Ok(applied)
    }

    fn bootstrap_database(
        &self,
        conn: &Connection,
        now: OffsetDateTime,
    ) -> Result<(), RagmillError> {
        let bootstrap = self.runner.bootstrap();
        let applied = vec![bootstrap.short.clone()];
        let ledger = self.runner.ledger_checksum(&applied)?;

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&bootstrap.up_sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (shortuuid7, direction, checksum, applied_at)
             VALUES (?1, 'up', ?2, ?3)",
            rusqlite::params![bootstrap.short, bootstrap.checksum_up, to_rfc3339(now)],
        )?;
        tx.execute(
            "INSERT INTO schema_meta (
                id, bootstrap_shortuuid7, head_migration_uuid7,
                head_migration_shortuuid7, ledger_checksum, last_vacuum_at
            ) VALUES (1, ?1, ?2, ?3, ?4, NULL)",
            rusqlite::params![
                bootstrap.short,
                bootstrap.uuid.to_string(),
                bootstrap.short,
                ledger
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn apply_migration(
        &self,
        conn: &Connection,
        migration: &Migration,
        applied_after: &[String],
        now: OffsetDateTime,
    ) -> Result<(), RagmillError> {
        let ledger = self.runner.ledger_checksum(applied_after)?;
        let head = self.head_of(applied_after);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (shortuuid7, direction, checksum, applied_at)
             VALUES (?1, 'up', ?2, ?3)",
            rusqlite::params![migration.short, migration.checksum_up, to_rfc3339(now)],
        )?;
        tx.execute(
            "UPDATE schema_meta
             SET head_migration_uuid7 = ?1,
                 head_migration_shortuuid7 = ?2,
                 ledger_checksum = ?3
             WHERE id = 1",
            rusqlite::params![head.0, head.1, ledger],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn rollback_migration(
        &self,
        conn: &Connection,
        migration: &Migration,
        applied_after: &[String],
        now: OffsetDateTime,
    ) -> Result<(), RagmillError> {
        let down_sql = migration.down_sql.as_ref().ok_or_else(|| {
            RagmillError::MigrationLoad(format!(
                "Cannot downgrade migration {}; missing .down script",
                migration.short
            ))
        })?;
        let checksum = migration
            .checksum_down
            .clone()
            .unwrap_or_else(|| migration.checksum_up.clone());
        let ledger = self.runner.ledger_checksum(applied_after)?;
        let head = self.head_of(applied_after);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(down_sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (shortuuid7, direction, checksum, applied_at)
             VALUES (?1, 'down', ?2, ?3)",
            rusqlite::params![migration.short, checksum, to_rfc3339(now)],
        )?;
        tx.execute(
            "UPDATE schema_meta
             SET head_migration_uuid7 = ?1,
                 head_migration_shortuuid7 = ?2,
                 ledger_checksum = ?3
             WHERE id = 1",
            rusqlite::params![head.0, head.1, ledger],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// `(uuid, short)` of the newest applied migration, falling back to the
    /// bootstrap when the applied set is empty.
    fn head_of(&self, applied: &[String]) -> (String, String) {
        let short = applied
            .last()
            .cloned()
            .unwrap_or_else(|| self.runner.bootstrap().short.clone());
        let uuid = self
            .runner
            .get(&short)
            .map(|m| m.uuid.to_string())
            .unwrap_or_default();
        (uuid, short)
    }

    /// Snapshot the on-disk state into a manifest payload, preserving the
    /// service-owned `last_ensure_at`.
    fn observe_state(
        &self,
        conn: &Connection,
        manifest: &DbManifestState,
    ) -> Result<DbManifestState, RagmillError> {
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
            .optional()?;

        let Some((bootstrap, head_uuid, head_short, ledger, last_vacuum_at)) = meta else {
            return Ok(manifest.clone());
        };

        let applied = self.applied_shorts(conn)?;
        let pending: Vec<String> = self
            .runner
            .pending(&applied)
            .iter()
            .map(|m| m.short.clone())
            .collect();

        Ok(DbManifestState {
            bootstrap_shortuuid7: Some(bootstrap),
            head_migration_uuid7: Some(head_uuid),
            head_migration_shortuuid7: Some(head_short),
            ledger_checksum: Some(ledger),
            last_vacuum_at: last_vacuum_at.and_then(|text| parse_rfc3339(&text).ok()),
            last_ensure_at: manifest.last_ensure_at,
            pending_migrations: pending,
        })
    }

    fn apply_pending(
        &self,
        conn: &Connection,
        steps: Option<usize>,
        now: OffsetDateTime,
    ) -> Result<Vec<String>, RagmillError> {
        let mut applied = self.applied_shorts(conn)?;
        let plan: Vec<Migration> = self
            .runner
            .pending(&applied)
            .into_iter()
            .take(steps.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let mut newly_applied = Vec::new();
        for migration in &plan {
            applied.push(migration.short.clone());
            applied.sort();
            self.apply_migration(conn, migration, &applied, now)?;
            newly_applied.push(migration.short.clone());
        }
        Ok(newly_applied)
    }
}

impl DbLifecycleBackend for SqliteLifecycleBackend {
    fn ensure(
        &self,
        _source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        now: OffsetDateTime,
    ) -> Result<DbEnsureOutcome, RagmillError> {
        let conn = db_connect(db_path)?;
        let mut applied_now = Vec::new();

        if !self.schema_present(&conn)? {
            self.bootstrap_database(&conn, now)?;
            applied_now.push(self.runner.bootstrap().short.clone());
        }
        if self.ensure_auto_upgrade {
            applied_now.extend(self.apply_pending(&conn, None, now)?);
        }

        Ok(DbEnsureOutcome {
            status: self.observe_state(&conn, manifest)?,
            applied_migrations: applied_now,
        })
    }

    fn upgrade(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        steps: Option<usize>,
        now: OffsetDateTime,
    ) -> Result<DbUpgradeOutcome, RagmillError> {
        let conn = db_connect(db_path)?;
        if !self.schema_present(&conn)? {
            return Err(RagmillError::DbLifecycle(format!(
                "Database for {source} is not bootstrapped; run ensure first"
            )));
        }
        let applied = self.apply_pending(&conn, steps, now)?;
        Ok(DbUpgradeOutcome {
            status: self.observe_state(&conn, manifest)?,
            applied_migrations: applied,
        })
    }

    fn downgrade(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        steps: usize,
        now: OffsetDateTime,
    ) -> Result<DbDowngradeOutcome, RagmillError> {
        let conn = db_connect(db_path)?;
        if !self.schema_present(&conn)? {
            return Err(RagmillError::DbLifecycle(format!(
                "Database for {source} is not bootstrapped; run ensure first"
            )));
        }

        let mut applied = self.applied_shorts(&conn)?;
        let plan: Vec<Migration> = self
            .runner
            .downgrade_plan(&applied, steps)?
            .into_iter()
            .cloned()
            .collect();

        let mut rolled_back = Vec::new();
        for migration in &plan {
            applied.retain(|short| short != &migration.short);
            self.rollback_migration(&conn, migration, &applied, now)?;
            rolled_back.push(migration.short.clone());
        }

        Ok(DbDowngradeOutcome {
            status: self.observe_state(&conn, manifest)?,
            rolled_back_migrations: rolled_back,
        })
    }

    fn info(
        &self,
        _source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        include_schema: bool,
        include_counts: bool,
        _now: OffsetDateTime,
    ) -> Result<DbInfoOutcome, RagmillError> {
        if !db_path.exists() {
            return Ok(DbInfoOutcome {
                status: manifest.clone(),
                schema: None,
                metadata: Map::new(),
            });
        }

        let conn = db_connect(db_path)?;
        let status = if self.schema_present(&conn)? {
            self.observe_state(&conn, manifest)?
        } else {
            manifest.clone()
        };

        let schema = if include_schema {
            let mut stmt = conn.prepare(
                "SELECT sql FROM sqlite_master
                 WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut statements = Vec::new();
            for row in rows {
                statements.push(format!("{};", row?));
            }
            Some(statements.join("\n"))
        } else {
            None
        };

        let mut metadata = Map::new();
        if include_counts {
            let mut counts = Map::new();
            let mut skipped = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let tables = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for table in tables {
                let table = table?;
                let limit = self.info_count_row_limit;
                let query = format!(
                    "SELECT COUNT(*) FROM (SELECT 1 FROM \"{table}\" LIMIT {})",
                    limit.saturating_add(1)
                );
                let count: i64 = conn.query_row(&query, [], |row| row.get(0))?;
                if limit > 0 && count as u64 > limit {
                    skipped.push(Value::Object(Map::from_iter([
                        ("table".to_string(), Value::String(table)),
                        (
                            "reason".to_string(),
                            Value::String("row-limit-exceeded".to_string()),
                        ),
                    ])));
                } else {
                    counts.insert(table, Value::Number(count.into()));
                }
            }
            metadata.insert("table_counts".to_string(), Value::Object(counts));
            if !skipped.is_empty() {
                metadata.insert("table_counts_skipped".to_string(), Value::Array(skipped));
            }
        }

        Ok(DbInfoOutcome {
            status,
            schema,
            metadata,
        })
    }

    fn vacuum(
        &self,
        _source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        _concurrency: Option<Concurrency>,
        now: OffsetDateTime,
    ) -> Result<DbVacuumOutcome, RagmillError> {
        let conn = db_connect(db_path)?;
        conn.execute_batch("VACUUM;")?;
        if self.schema_present(&conn)? {
            conn.execute(
                "UPDATE schema_meta SET last_vacuum_at = ?1 WHERE id = 1",
                rusqlite::params![to_rfc3339(now)],
            )?;
        }
        Ok(DbVacuumOutcome {
            status: self.observe_state(&conn, manifest)?,
        })
    }

    fn run(
        &self,
        _source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        sql_path: &Path,
        autocommit: bool,
        _now: OffsetDateTime,
    ) -> Result<DbRunOutcome, RagmillError> {
        let raw = fs::read_to_string(sql_path)?;
        let sql = normalize_sql(&raw);
        let conn = db_connect(db_path)?;
        if autocommit {
            conn.execute_batch(&sql)?;
        } else {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(&sql)?;
            tx.commit()?;
        }
        let status = if self.schema_present(&conn)? {
            self.observe_state(&conn, manifest)?
        } else {
            manifest.clone()
        };
        Ok(DbRunOutcome { status })
    }

    fn reset(
        &self,
        source: &str,
        db_path: &Path,
        manifest: &DbManifestState,
        force: bool,
        now: OffsetDateTime,
    ) -> Result<DbResetOutcome, RagmillError> {
        if !force {
            return Err(RagmillError::DbLifecycle(format!(
                "reset for {source} requires force"
            )));
        }
        for suffix in ["", "-wal", "-shm"] {
            let target = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                db_path.with_file_name(format!(
                    "{}{suffix}",
                    db_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                ))
            };
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let fresh = DbManifestState {
            last_ensure_at: manifest.last_ensure_at,
            ..DbManifestState::default()
        };
        let outcome = self.ensure(source, db_path, &fresh, now)?;
        Ok(DbResetOutcome {
            status: outcome.status,
        })
    }
}

/// Do-nothing backend used as a boot-time placeholder. Never wire it where
/// a real schema is expected after `ensure`.
pub struct NullLifecycleBackend;

impl DbLifecycleBackend for NullLifecycleBackend {
    fn ensure(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _now: OffsetDateTime,
    ) -> Result<DbEnsureOutcome, RagmillError> {
        Ok(DbEnsureOutcome {
            status: manifest.clone(),
            applied_migrations: Vec::new(),
        })
    }

    fn upgrade(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _steps: Option<usize>,
        _now: OffsetDateTime,
    ) -> Result<DbUpgradeOutcome, RagmillError> {
        Ok(DbUpgradeOutcome {
            status: manifest.clone(),
            applied_migrations: Vec::new(),
        })
    }

    fn downgrade(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _steps: usize,
        _now: OffsetDateTime,
    ) -> Result<DbDowngradeOutcome, RagmillError> {
        Ok(DbDowngradeOutcome {
            status: manifest.clone(),
            rolled_back_migrations: Vec::new(),
        })
    }

    fn info(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _include_schema: bool,
        _include_counts: bool,
        _now: OffsetDateTime,
    ) -> Result<DbInfoOutcome, RagmillError> {
        Ok(DbInfoOutcome {
            status: manifest.clone(),
            schema: None,
            metadata: Map::new(),
        })
    }

    fn vacuum(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _concurrency: Option<Concurrency>,
        _now: OffsetDateTime,
    ) -> Result<DbVacuumOutcome, RagmillError> {
        Ok(DbVacuumOutcome {
            status: manifest.clone(),
        })
    }

    fn run(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _sql_path: &Path,
        _autocommit: bool,
        _now: OffsetDateTime,
    ) -> Result<DbRunOutcome, RagmillError> {
        Ok(DbRunOutcome {
            status: manifest.clone(),
        })
    }

    fn reset(
        &self,
        _source: &str,
        _db_path: &Path,
        manifest: &DbManifestState,
        _force: bool,
        _now: OffsetDateTime,
    ) -> Result<DbResetOutcome, RagmillError> {
        Ok(DbResetOutcome {
            status: manifest.clone(),
        })
    }
}

/// Default backend wiring: the SQLite implementation over the migrations
/// resolved from configuration.
pub fn build_default_backend(
    settings: &DbSettings,
) -> Result<Box<dyn DbLifecycleBackend>, RagmillError> {
    let runner = MigrationRunner::resolve(&settings.migrations_path)?;
    Ok(Box::new(SqliteLifecycleBackend::new(runner, settings)))
}
