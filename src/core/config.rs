//! Configuration models and loaders for `ragmill.toml`.
//!
//! The document is parsed into a retained `toml::Table` so unknown keys
//! survive rewrites; typed settings are read out of it with defaults. The
//! core consumes `workspace.*`, `modules.*`, `db.*`, and `modules.parser.*`
//! keys; everything else is preserved verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::Table;
use toml::Value;

use crate::core::error::RagmillError;
use crate::core::paths::WorkspacePaths;

/// Module key used for the database payload in manifests and config.
pub const DB_MODULE_KEY: &str = "db";
/// Module key used for the parser payload in manifests and config.
pub const PARSER_MODULE_KEY: &str = "parser";
/// Module key used for source metadata in manifests.
pub const SOURCE_MODULE_KEY: &str = "source";

/// Toggle controlling whether an optional module is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleToggle {
    pub enabled: bool,
}

impl Default for ModuleToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-source workspace configuration (`workspace.sources.<slug>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub target: Option<String>,
}

/// Gitignore handling for traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitignoreBehavior {
    None,
    Repo,
    Workspace,
    Combined,
}

impl GitignoreBehavior {
    pub fn parse(value: &str) -> Result<Self, RagmillError> {
        match value {
            "none" => Ok(GitignoreBehavior::None),
            "repo" => Ok(GitignoreBehavior::Repo),
            "workspace" => Ok(GitignoreBehavior::Workspace),
            "combined" => Ok(GitignoreBehavior::Combined),
            other => Err(RagmillError::ConfigError(format!(
                "Unknown gitignore behavior {other:?} (expected none|repo|workspace|combined)"
            ))),
        }
    }

    pub fn repo_enabled(self) -> bool {
        matches!(self, GitignoreBehavior::Repo | GitignoreBehavior::Combined)
    }

    pub fn workspace_enabled(self) -> bool {
        matches!(
            self,
            GitignoreBehavior::Workspace | GitignoreBehavior::Combined
        )
    }
}

/// `int | "auto"` knobs (worker pools, vacuum concurrency).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Auto,
    Fixed(usize),
}

impl Concurrency {
    /// Resolve against the machine's available parallelism.
    pub fn resolve(self) -> usize {
        match self {
            Concurrency::Fixed(n) => n.max(1),
            Concurrency::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Per-handler parser configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserHandlerSettings {
    pub enabled: bool,
    /// `Some(n)` caps chunks at `n` tokens; `None` inherits the general cap.
    pub max_tokens: Option<usize>,
}

impl Default for ParserHandlerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: None,
        }
    }
}

/// Settings consumed by the parser module (`modules.parser`).
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub enabled: bool,
    /// General token cap applied when a handler has no override. `None`
    /// disables capping.
    pub general_max_tokens: Option<usize>,
    pub gitignore_behavior: GitignoreBehavior,
    pub max_concurrency: Concurrency,
    pub lock_wait_warning_seconds: f64,
    pub lock_wait_error_seconds: f64,
    pub lock_contention_warning: u64,
    pub lock_contention_error: u64,
    pub handlers: BTreeMap<String, ParserHandlerSettings>,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            general_max_tokens: Some(4096),
            gitignore_behavior: GitignoreBehavior::Combined,
            max_concurrency: Concurrency::Auto,
            lock_wait_warning_seconds: 5.0,
            lock_wait_error_seconds: 30.0,
            lock_contention_warning: 3,
            lock_contention_error: 10,
            handlers: BTreeMap::new(),
        }
    }
}

impl ParserSettings {
    pub fn handler(&self, name: &str) -> ParserHandlerSettings {
        self.handlers.get(name).copied().unwrap_or_default()
    }

    /// Effective token cap for `handler`: per-handler override, else the
    /// general cap. `None` means unbounded.
    pub fn handler_max_tokens(&self, handler: &str) -> Option<usize> {
        match self.handler(handler).max_tokens {
            Some(limit) => Some(limit),
            None => self.general_max_tokens,
        }
    }

    pub fn handler_enabled(&self, name: &str) -> bool {
        self.handler(name).enabled
    }
}

/// Settings consumed by the database module (`db.*`).
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub migrations_path: String,
    pub ensure_auto_upgrade: bool,
    pub vacuum_max_stale_days: i64,
    pub vacuum_concurrency: Concurrency,
    pub run_allow_outside: bool,
    pub run_autocommit_default: bool,
    pub drift_warning_seconds: i64,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub lock_suffix: String,
    pub lock_namespace: String,
    pub info_count_timeout_ms: u64,
    pub info_count_row_limit: u64,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            migrations_path: "resources/db/migrations".to_string(),
            ensure_auto_upgrade: true,
            vacuum_max_stale_days: 7,
            vacuum_concurrency: Concurrency::Auto,
            run_allow_outside: true,
            run_autocommit_default: false,
            drift_warning_seconds: 0,
            lock_timeout: Duration::from_secs_f64(10.0),
            lock_poll_interval: Duration::from_secs_f64(0.1),
            lock_suffix: ".lock".to_string(),
            lock_namespace: "db".to_string(),
            info_count_timeout_ms: 1000,
            info_count_row_limit: 500_000,
        }
    }
}

/// Settings controlling manifest IO behavior. Keys live under the `db`
/// table (`db.manifest_*`) so db and manifest tuning travel together.
#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub modules_key: String,
    pub db_module_key: String,
    pub backup_retention: usize,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub lock_suffix: String,
    pub backup_suffix: String,
    pub strict_writes: bool,
    pub backups_enabled: bool,
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            modules_key: "modules".to_string(),
            db_module_key: DB_MODULE_KEY.to_string(),
            backup_retention: 5,
            lock_timeout: Duration::from_secs_f64(5.0),
            lock_poll_interval: Duration::from_secs_f64(0.1),
            lock_suffix: ".lock".to_string(),
            backup_suffix: ".bak".to_string(),
            strict_writes: true,
            backups_enabled: true,
        }
    }
}

/// Root configuration for the ragmill application.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub workspace_root: Option<PathBuf>,
    pub modules: BTreeMap<String, ModuleToggle>,
    pub sources: BTreeMap<String, SourceConfig>,
    pub ignore_patterns: Vec<String>,
    pub parser: ParserSettings,
    pub db: DbSettings,
    pub manifest: ManifestSettings,
    /// The parsed document, preserved for rewrites (unknown keys survive).
    pub raw: Table,
}

impl AppConfig {
    /// Load configuration from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, RagmillError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RagmillError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: Table = text
            .parse()
            .map_err(|err| RagmillError::ConfigError(format!("Invalid TOML: {err}")))?;
        Self::from_table(raw)
    }

    pub fn from_table(raw: Table) -> Result<Self, RagmillError> {
        let workspace = table_at(&raw, &["workspace"]);
        let workspace_root = workspace
            .and_then(|t| read_string(t, "root"))
            .map(PathBuf::from);

        let mut sources = BTreeMap::new();
        if let Some(entries) = workspace.and_then(|t| t.get("sources")).and_then(Value::as_table) {
            for (slug, value) in entries {
                let Some(entry) = value.as_table() else {
                    return Err(RagmillError::ConfigError(format!(
                        "workspace.sources.{slug} must be a table"
                    )));
                };
                let path = read_string(entry, "path").ok_or_else(|| {
                    RagmillError::ConfigError(format!(
                        "workspace.sources.{slug} is missing `path`"
                    ))
                })?;
                sources.insert(
                    slug.clone(),
                    SourceConfig {
                        enabled: read_bool(entry, "enabled").unwrap_or(true),
                        path: PathBuf::from(path),
                        target: read_string(entry, "target"),
                    },
                );
            }
        }

        let ignore_patterns = workspace
            .and_then(|t| t.get("ignore_patterns"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut modules = BTreeMap::new();
        if let Some(entries) = table_at(&raw, &["modules"]) {
            for (name, value) in entries {
                if name == PARSER_MODULE_KEY {
                    continue;
                }
                if let Some(entry) = value.as_table() {
                    modules.insert(
                        name.clone(),
                        ModuleToggle {
                            enabled: read_bool(entry, "enabled").unwrap_or(true),
                        },
                    );
                }
            }
        }

        let parser = parser_settings_from_table(table_at(&raw, &["modules", "parser"]))?;
        if let Some(entry) = table_at(&raw, &["modules", "parser"]) {
            modules.insert(
                PARSER_MODULE_KEY.to_string(),
                ModuleToggle {
                    enabled: read_bool(entry, "enabled").unwrap_or(true),
                },
            );
        }

        let db_table = table_at(&raw, &["db"]);
        let db = db_settings_from_table(db_table)?;
        let manifest = manifest_settings_from_table(db_table)?;

        Ok(Self {
            workspace_root,
            modules,
            sources,
            ignore_patterns,
            parser,
            db,
            manifest,
            raw,
        })
    }

    pub fn module_enabled(&self, name: &str) -> bool {
        self.modules
            .get(name)
            .map(|toggle| toggle.enabled)
            .unwrap_or(true)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(name)
    }

    /// Sorted `(slug, config)` pairs for every configured source.
    pub fn iter_sources(&self) -> impl Iterator<Item = (&String, &SourceConfig)> {
        self.sources.iter()
    }

    /// Install or replace a source entry in both the typed view and the
    /// retained document.
    pub fn set_source(&mut self, slug: &str, source: SourceConfig) {
        let workspace = self
            .raw
            .entry("workspace".to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !workspace.is_table() {
            *workspace = Value::Table(Table::new());
        }
        let sources = workspace
            .as_table_mut()
            .unwrap()
            .entry("sources".to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !sources.is_table() {
            *sources = Value::Table(Table::new());
        }

        let mut entry = Table::new();
        entry.insert("enabled".to_string(), Value::Boolean(source.enabled));
        entry.insert(
            "path".to_string(),
            Value::String(source.path.to_string_lossy().to_string()),
        );
        if let Some(target) = &source.target {
            entry.insert("target".to_string(), Value::String(target.clone()));
        }
        sources
            .as_table_mut()
            .unwrap()
            .insert(slug.to_string(), Value::Table(entry));
        self.sources.insert(slug.to_string(), source);
    }

    /// Serialize the retained document; unknown keys are preserved.
    pub fn to_toml_string(&self) -> Result<String, RagmillError> {
        toml::to_string_pretty(&self.raw)
            .map_err(|err| RagmillError::ConfigError(format!("Failed rendering config: {err}")))
    }

    /// Persist to `path` with the same atomic-replace discipline as
    /// manifests.
    pub fn save(&self, path: &Path) -> Result<(), RagmillError> {
        let payload = self.to_toml_string()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_file_name(format!(
            ".{}.tmp-{}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            std::process::id()
        ));
        fs::write(&staging, payload.as_bytes())?;
        if let Err(err) = fs::rename(&staging, path) {
            let _ = fs::remove_file(&staging);
            return Err(RagmillError::ConfigError(format!(
                "Failed writing config at {}: {err}",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Workspace paths paired with loaded configuration, handed to health hooks
/// and services.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub paths: WorkspacePaths,
    pub config: AppConfig,
}

fn table_at<'a>(root: &'a Table, keys: &[&str]) -> Option<&'a Table> {
    let mut current = root;
    for key in keys {
        current = current.get(*key)?.as_table()?;
    }
    Some(current)
}

fn read_string(table: &Table, key: &str) -> Option<String> {
    table.get(key).and_then(Value::as_str).map(str::to_string)
}

fn read_bool(table: &Table, key: &str) -> Option<bool> {
    table.get(key).and_then(Value::as_bool)
}

fn read_int(table: &Table, key: &str) -> Option<i64> {
    table.get(key).and_then(Value::as_integer)
}

fn read_float(table: &Table, key: &str) -> Option<f64> {
    table.get(key).and_then(|value| match value {
        Value::Float(f) => Some(*f),
        Value::Integer(i) => Some(*i as f64),
        _ => None,
    })
}

fn read_concurrency(table: &Table, key: &str, default: Concurrency) -> Result<Concurrency, RagmillError> {
    match table.get(key) {
        None => Ok(default),
        Some(Value::String(text)) if text == "auto" => Ok(Concurrency::Auto),
        Some(Value::Integer(n)) if *n >= 1 => Ok(Concurrency::Fixed(*n as usize)),
        Some(other) => Err(RagmillError::ConfigError(format!(
            "{key} must be a positive integer or \"auto\", got {other:?}"
        ))),
    }
}

fn parser_settings_from_table(table: Option<&Table>) -> Result<ParserSettings, RagmillError> {
    let mut settings = ParserSettings::default();
    let Some(table) = table else {
        return Ok(settings);
    };

    if let Some(enabled) = read_bool(table, "enabled") {
        settings.enabled = enabled;
    }
    if let Some(value) = read_int(table, "general_max_tokens") {
        settings.general_max_tokens = if value > 0 { Some(value as usize) } else { None };
    }
    if let Some(value) = read_string(table, "gitignore_behavior") {
        settings.gitignore_behavior = GitignoreBehavior::parse(&value)?;
    }
    settings.max_concurrency = read_concurrency(table, "max_concurrency", Concurrency::Auto)?;
    if let Some(value) = read_float(table, "lock_wait_warning_seconds") {
        settings.lock_wait_warning_seconds = value;
    }
    if let Some(value) = read_float(table, "lock_wait_error_seconds") {
        settings.lock_wait_error_seconds = value;
    }
    if let Some(value) = read_int(table, "lock_contention_warning") {
        settings.lock_contention_warning = value.max(0) as u64;
    }
    if let Some(value) = read_int(table, "lock_contention_error") {
        settings.lock_contention_error = value.max(0) as u64;
    }

    if let Some(handlers) = table.get("handlers").and_then(Value::as_table) {
        for (name, value) in handlers {
            let Some(entry) = value.as_table() else {
                continue;
            };
            let mut handler = ParserHandlerSettings::default();
            if let Some(enabled) = read_bool(entry, "enabled") {
                handler.enabled = enabled;
            }
            handler.max_tokens = match entry.get("max_tokens") {
                None => None,
                Some(Value::String(text)) if text == "auto" => None,
                Some(Value::Integer(n)) if *n > 0 => Some(*n as usize),
                Some(Value::Integer(_)) => None,
                Some(other) => {
                    return Err(RagmillError::ConfigError(format!(
                        "modules.parser.handlers.{name}.max_tokens must be a \
                         positive integer or \"auto\", got {other:?}"
                    )))
                }
            };
            settings.handlers.insert(name.clone(), handler);
        }
    }

    Ok(settings)
}

fn db_settings_from_table(table: Option<&Table>) -> Result<DbSettings, RagmillError> {
    let mut settings = DbSettings::default();
    let Some(table) = table else {
        return Ok(settings);
    };

    if let Some(value) = read_string(table, "migrations_path") {
        settings.migrations_path = value;
    }
    if let Some(value) = read_bool(table, "ensure_auto_upgrade") {
        settings.ensure_auto_upgrade = value;
    }
    if let Some(value) = read_int(table, "vacuum_max_stale_days") {
        settings.vacuum_max_stale_days = value;
    }
    settings.vacuum_concurrency = read_concurrency(table, "vacuum_concurrency", Concurrency::Auto)?;
    if let Some(value) = read_bool(table, "run_allow_outside") {
        settings.run_allow_outside = value;
    }
    if let Some(value) = read_bool(table, "run_autocommit_default") {
        settings.run_autocommit_default = value;
    }
    if let Some(value) = read_int(table, "drift_warning_seconds") {
        settings.drift_warning_seconds = value;
    }
    if let Some(value) = read_float(table, "lock_timeout") {
        settings.lock_timeout = Duration::from_secs_f64(value.max(0.0));
    }
    if let Some(value) = read_float(table, "lock_poll_interval") {
        settings.lock_poll_interval = Duration::from_secs_f64(value.max(0.001));
    }
    if let Some(value) = read_string(table, "lock_suffix") {
        settings.lock_suffix = value;
    }
    if let Some(value) = read_string(table, "lock_namespace") {
        settings.lock_namespace = value;
    }
    if let Some(value) = read_int(table, "info_count_timeout_ms") {
        settings.info_count_timeout_ms = value.max(0) as u64;
    }
    if let Some(value) = read_int(table, "info_count_row_limit") {
        settings.info_count_row_limit = value.max(0) as u64;
    }

    Ok(settings)
}

fn manifest_settings_from_table(table: Option<&Table>) -> Result<ManifestSettings, RagmillError> {
    let mut settings = ManifestSettings::default();
    let Some(table) = table else {
        return Ok(settings);
    };

    if let Some(value) = read_string(table, "manifest_modules_key") {
        settings.modules_key = value;
    }
    if let Some(value) = read_string(table, "manifest_db_module_key") {
        settings.db_module_key = value;
    }
    if let Some(value) = read_int(table, "manifest_backup_retention") {
        settings.backup_retention = value.max(0) as usize;
    }
    if let Some(value) = read_float(table, "manifest_lock_timeout") {
        settings.lock_timeout = Duration::from_secs_f64(value.max(0.0));
    }
    if let Some(value) = read_float(table, "manifest_lock_poll_interval") {
        settings.lock_poll_interval = Duration::from_secs_f64(value.max(0.001));
    }
    if let Some(value) = read_string(table, "manifest_lock_suffix") {
        settings.lock_suffix = value;
    }
    if let Some(value) = read_string(table, "manifest_backup_suffix") {
        settings.backup_suffix = value;
    }
    if let Some(value) = read_bool(table, "manifest_strict") {
        settings.strict_writes = value;
    }
    if let Some(value) = read_bool(table, "manifest_backups_enabled") {
        settings.backups_enabled = value;
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_document() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert!(config.parser.enabled);
        assert_eq!(config.db.vacuum_max_stale_days, 7);
        assert_eq!(config.manifest.backup_retention, 5);
        assert!(config.module_enabled("db"));
    }

    #[test]
    fn test_parse_sources_and_parser_settings() {
        let text = r#"
[workspace]
root = "/tmp/ws"
ignore_patterns = ["*.log"]

[workspace.sources.demo]
enabled = true
path = "/tmp/demo"

[modules.parser]
enabled = true
general_max_tokens = 512
gitignore_behavior = "repo"
max_concurrency = 2

[modules.parser.handlers.markdown]
enabled = false

[db]
vacuum_max_stale_days = 3
manifest_backup_retention = 2
"#;
        let config = AppConfig::from_toml_str(text).unwrap();
        assert_eq!(config.workspace_root, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(config.ignore_patterns, vec!["*.log".to_string()]);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.parser.general_max_tokens, Some(512));
        assert_eq!(config.parser.max_concurrency, Concurrency::Fixed(2));
        assert!(!config.parser.handler_enabled("markdown"));
        assert_eq!(config.parser.handler_max_tokens("text"), Some(512));
        assert_eq!(config.db.vacuum_max_stale_days, 3);
        assert_eq!(config.manifest.backup_retention, 2);
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let text = "[custom]\nanswer = 42\n";
        let mut config = AppConfig::from_toml_str(text).unwrap();
        config.set_source(
            "demo",
            SourceConfig {
                enabled: true,
                path: PathBuf::from("/tmp/demo"),
                target: None,
            },
        );
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("answer = 42"));
        assert!(rendered.contains("[workspace.sources.demo]"));
    }

    #[test]
    fn test_handler_max_tokens_auto_inherits_general() {
        let text = r#"
[modules.parser]
general_max_tokens = 100

[modules.parser.handlers.text]
max_tokens = "auto"

[modules.parser.handlers.css]
max_tokens = 9
"#;
        let config = AppConfig::from_toml_str(text).unwrap();
        assert_eq!(config.parser.handler_max_tokens("text"), Some(100));
        assert_eq!(config.parser.handler_max_tokens("css"), Some(9));
    }
}
