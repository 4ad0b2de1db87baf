//! Migration discovery, validation, and planning.
//!
//! Migrations are paired `<short>.up.sql` / `<short>.down.sql` scripts whose
//! first non-empty line carries `-- uuid7: <uuid>` metadata. The filename
//! short form must equal the Crockford encoding of that UUID, ordering by
//! short form must agree with canonical UUID order, the lexicographically
//! smallest migration is the bootstrap (and must not have a down script),
//! and every other migration must have one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::error::RagmillError;
use crate::core::uuid7::{ensure_short_uuid7_order, short_uuid7, validate_short_uuid7};

/// Packaged migrations shipped with the binary. Paths are relative to the
/// crate root, mirroring the on-disk layout under `resources/`.
const EMBEDDED_MIGRATIONS: &[(&str, &str)] = &[
    (
        "06801HWW01TV.up.sql",
        include_str!("../../resources/db/migrations/06801HWW01TV.up.sql"),
    ),
    (
        "06801M63R1ST.up.sql",
        include_str!("../../resources/db/migrations/06801M63R1ST.up.sql"),
    ),
    (
        "06801M63R1ST.down.sql",
        include_str!("../../resources/db/migrations/06801M63R1ST.down.sql"),
    ),
    (
        "06801PFBG1YK.up.sql",
        include_str!("../../resources/db/migrations/06801PFBG1YK.up.sql"),
    ),
    (
        "06801PFBG1YK.down.sql",
        include_str!("../../resources/db/migrations/06801PFBG1YK.down.sql"),
    ),
];

fn metadata_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^--\s*uuid7:\s*([0-9a-fA-F-]{36})\s*$").unwrap())
}

/// A paired up/down migration script.
#[derive(Debug, Clone)]
pub struct Migration {
    pub uuid: Uuid,
    pub short: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    pub checksum_up: String,
    pub checksum_down: Option<String>,
}

/// Loads migrations and produces upgrade/downgrade plans.
#[derive(Debug)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
    index: FxHashMap<String, usize>,
}

impl MigrationRunner {
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self, RagmillError> {
        if migrations.is_empty() {
            return Err(RagmillError::MigrationLoad(
                "No migrations discovered".to_string(),
            ));
        }

        migrations.sort_by(|a, b| a.short.cmp(&b.short));
        let uuids: Vec<Uuid> = migrations.iter().map(|m| m.uuid).collect();
        if !ensure_short_uuid7_order(&uuids) {
            return Err(RagmillError::MigrationLoad(
                "shortuuid7 ordering does not match canonical UUID7 ordering".to_string(),
            ));
        }

        let mut index = FxHashMap::default();
        for (position, migration) in migrations.iter().enumerate() {
            if index.insert(migration.short.clone(), position).is_some() {
                return Err(RagmillError::MigrationLoad(
                    "Duplicate migration identifiers detected".to_string(),
                ));
            }
        }

        if migrations[0].down_sql.is_some() {
            return Err(RagmillError::MigrationLoad(
                "Bootstrap migration must not provide a .down script".to_string(),
            ));
        }
        for migration in &migrations[1..] {
            if migration.down_sql.is_none() {
                return Err(RagmillError::MigrationLoad(format!(
                    "Missing .down script for migration {}",
                    migration.short
                )));
            }
        }

        Ok(Self { migrations, index })
    }

    /// Load from an on-disk directory of paired scripts.
    pub fn from_path(path: &Path) -> Result<Self, RagmillError> {
        if !path.is_dir() {
            return Err(RagmillError::MigrationLoad(format!(
                "Migration path not found: {}",
                path.display()
            )));
        }

        let mut scripts: BTreeMap<String, String> = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".up.sql") || name.ends_with(".down.sql") {
                let text = fs::read_to_string(entry.path())?;
                scripts.insert(name, text);
            }
        }
        Self::from_scripts(&scripts)
    }

    /// Load the migrations embedded in the binary.
    pub fn from_embedded() -> Result<Self, RagmillError> {
        let scripts: BTreeMap<String, String> = EMBEDDED_MIGRATIONS
            .iter()
            .map(|(name, text)| (name.to_string(), text.to_string()))
            .collect();
        Self::from_scripts(&scripts)
    }

    /// Resolve `migrations_path` config: absolute paths load from disk,
    /// the packaged default loads the embedded set.
    pub fn resolve(migrations_path: &str) -> Result<Self, RagmillError> {
        let path = Path::new(migrations_path);
        if path.is_absolute() {
            Self::from_path(path)
        } else {
            Self::from_embedded()
        }
    }

    fn from_scripts(scripts: &BTreeMap<String, String>) -> Result<Self, RagmillError> {
        let mut ups: BTreeMap<String, &String> = BTreeMap::new();
        let mut downs: BTreeMap<String, &String> = BTreeMap::new();
        for (name, text) in scripts {
            if let Some(short) = name.strip_suffix(".up.sql") {
                ups.insert(short.to_string(), text);
            } else if let Some(short) = name.strip_suffix(".down.sql") {
                downs.insert(short.to_string(), text);
            }
        }
        if ups.is_empty() {
            return Err(RagmillError::MigrationLoad(
                "No .up.sql migrations discovered".to_string(),
            ));
        }

        let mut migrations = Vec::with_capacity(ups.len());
        for (short, up_raw) in &ups {
            validate_short_uuid7(short).map_err(|err| {
                RagmillError::MigrationLoad(format!("Invalid migration filename {short:?}: {err}"))
            })?;
            let uuid = extract_uuid7(up_raw, &format!("{short}.up.sql"), None)?;
            let canonical = short_uuid7(&uuid);
            if &canonical != short {
                return Err(RagmillError::MigrationLoad(format!(
                    "Short UUID mismatch for {short}.up.sql: filename {short} \
                     does not match canonical {canonical}"
                )));
            }

            let down_sql = match downs.get(short) {
                Some(down_raw) => {
                    extract_uuid7(down_raw, &format!("{short}.down.sql"), Some(uuid))?;
                    let normalized = normalize_sql(down_raw);
                    if normalized.is_empty() {
                        None
                    } else {
                        Some(normalized)
                    }
                }
                None => None,
            };

            let up_sql = normalize_sql(up_raw);
            let checksum_up = checksum(&up_sql);
            let checksum_down = down_sql.as_deref().map(checksum);

            migrations.push(Migration {
                uuid,
                short: short.clone(),
                up_sql,
                down_sql,
                checksum_up,
                checksum_down,
            });
        }

        Self::new(migrations)
    }

    pub fn list_all(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn bootstrap(&self) -> &Migration {
        &self.migrations[0]
    }

    pub fn get(&self, short: &str) -> Option<&Migration> {
        self.index.get(short).map(|&position| &self.migrations[position])
    }

    /// Migrations whose short form is not in `applied`, in canonical order.
    pub fn pending(&self, applied: &[String]) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|migration| !applied.iter().any(|short| short == &migration.short))
            .collect()
    }

    /// Walk `applied` newest-to-oldest and return up to `steps` non-bootstrap
    /// migrations to roll back. Stops at the bootstrap; a missing down
    /// script mid-plan is a loader-level error.
    pub fn downgrade_plan(
        &self,
        applied: &[String],
        steps: usize,
    ) -> Result<Vec<&Migration>, RagmillError> {
        if steps < 1 {
            return Err(RagmillError::MigrationLoad(
                "downgrade steps must be >= 1".to_string(),
            ));
        }

        let known: Vec<&Migration> = applied
            .iter()
            .filter_map(|short| self.get(short))
            .collect();

        let mut plan = Vec::new();
        for migration in known.iter().rev() {
            if plan.len() == steps {
                break;
            }
            if migration.short == self.bootstrap().short {
                break;
            }
            if migration.down_sql.is_none() {
                return Err(RagmillError::MigrationLoad(format!(
                    "Cannot downgrade migration {}; missing .down script",
                    migration.short
                )));
            }
            plan.push(*migration);
        }
        Ok(plan)
    }

    /// Deterministic fingerprint over an applied set, in canonical order:
    /// `sha256:` + sha256 of `short:checksum_up` parts joined by `|`.
    pub fn ledger_checksum(&self, applied: &[String]) -> Result<String, RagmillError> {
        let mut parts = Vec::with_capacity(applied.len());
        let mut ordered: Vec<&String> = applied.iter().collect();
        ordered.sort();
        for short in ordered {
            let migration = self.get(short).ok_or_else(|| {
                RagmillError::MigrationLoad(format!(
                    "Unknown migration recorded in ledger: {short}"
                ))
            })?;
            parts.push(format!("{}:{}", migration.short, migration.checksum_up));
        }
        let payload = parts.join("|");
        let mut digest = Sha256::new();
        digest.update(payload.as_bytes());
        Ok(format!("sha256:{:x}", digest.finalize()))
    }
}

fn extract_uuid7(sql_text: &str, label: &str, expected: Option<Uuid>) -> Result<Uuid, RagmillError> {
    let first_line = sql_text
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");
    let captures = metadata_pattern().captures(first_line.trim()).ok_or_else(|| {
        RagmillError::MigrationLoad(format!(
            "Migration {label} must begin with `-- uuid7: <uuid>` metadata"
        ))
    })?;
    let value = Uuid::parse_str(&captures[1]).map_err(|err| {
        RagmillError::MigrationLoad(format!("Migration {label} has an invalid uuid7: {err}"))
    })?;
    if let Some(expected) = expected {
        if value != expected {
            return Err(RagmillError::MigrationLoad(format!(
                "Migration {label} uuid7 {value} did not match paired script"
            )));
        }
    }
    Ok(value)
}

/// CRLF/CR → LF, right-trim each line, strip surrounding blank lines, and
/// ensure a trailing newline.
pub fn normalize_sql(sql: &str) -> String {
    let unified = sql.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = unified.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = trimmed.lines().map(str::trim_end).collect();
    let mut normalized = lines.join("\n");
    normalized.push('\n');
    normalized
}

fn checksum(sql: &str) -> String {
    let mut digest = Sha256::new();
    digest.update(sql.as_bytes());
    format!("sha256:{:x}", digest.finalize())
}
