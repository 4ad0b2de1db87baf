//! Source management: init, list, enable/disable, refresh.
//!
//! A source pairs a workspace directory (manifest + database) with a
//! configured target path. State lives in `modules.source` of the manifest;
//! the configuration document records the slug-to-path binding.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::core::config::{AppConfig, SourceConfig, SOURCE_MODULE_KEY};
use crate::core::error::RagmillError;
use crate::core::health::HealthStatus;
use crate::core::paths::WorkspacePaths;
use crate::core::source::normalize_source_slug;
use crate::core::time::{now_utc, to_rfc3339};
use crate::modules::manifest::ManifestService;
use crate::modules::manifest_migrator::MODULES_VERSION;

/// Summary row returned by `list`.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub target: Option<String>,
    pub last_refresh_at: Option<String>,
    pub health_status: HealthStatus,
}

/// Manifest-backed source operations.
pub struct SourceService {
    paths: WorkspacePaths,
    manifest: ManifestService,
}

impl SourceService {
    pub fn new(paths: WorkspacePaths, config: &AppConfig) -> Self {
        let manifest = ManifestService::new(paths.clone(), config.manifest.clone());
        Self { paths, manifest }
    }

    /// Initialize a source: normalize the slug, validate the target,
    /// create the source directory, and seed `modules.source`.
    ///
    /// Returns the slug and its updated configuration entry; the caller
    /// persists the configuration document.
    pub fn init(
        &self,
        raw_name: &str,
        target: &Path,
        config: &mut AppConfig,
    ) -> Result<String, RagmillError> {
        let slug = normalize_source_slug(raw_name)?;
        let target = crate::core::paths::normalize_path(&crate::core::paths::expand_tilde(target));
        if !target.is_dir() {
            return Err(RagmillError::PathError(format!(
                "Target path must be an existing directory: {}",
                target.display()
            )));
        }

        let source_ref = self.manifest.resolve(&slug);
        source_ref.ensure_directories()?;

        let now = now_utc();
        self.manifest.write(&slug, |snapshot| {
            let module = snapshot.ensure_module(SOURCE_MODULE_KEY);
            module.insert("name".to_string(), Value::String(slug.clone()));
            module.insert(
                "path".to_string(),
                Value::String(source_ref.root.to_string_lossy().to_string()),
            );
            module.insert("enabled".to_string(), Value::Bool(true));
            module.insert(
                "target".to_string(),
                Value::String(target.to_string_lossy().to_string()),
            );
            module.insert(
                "last_refresh_at".to_string(),
                Value::String(to_rfc3339(now)),
            );
            module.insert("last_health".to_string(), default_health_payload(now));
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })?;

        config.set_source(
            &slug,
            SourceConfig {
                enabled: true,
                path: target,
                target: None,
            },
        );
        Ok(slug)
    }

    /// Summaries for every configured source, sorted by slug.
    pub fn list(&self, config: &AppConfig) -> Vec<SourceInfo> {
        config
            .iter_sources()
            .map(|(name, source)| {
                let (last_refresh_at, health_status) = self
                    .manifest
                    .load(name, false, false)
                    .ok()
                    .and_then(|snapshot| {
                        snapshot.module(SOURCE_MODULE_KEY).map(|module| {
                            let refresh = module
                                .get("last_refresh_at")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            let status = module
                                .get("last_health")
                                .and_then(|health| health.get("status"))
                                .and_then(Value::as_str)
                                .and_then(parse_status)
                                .unwrap_or(HealthStatus::Unknown);
                            (refresh, status)
                        })
                    })
                    .unwrap_or((None, HealthStatus::Unknown));

                SourceInfo {
                    name: name.clone(),
                    path: source.path.clone(),
                    enabled: source.enabled,
                    target: source.target.clone(),
                    last_refresh_at,
                    health_status,
                }
            })
            .collect()
    }

    /// Flip a source's enabled flag in both manifest and configuration.
    pub fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        config: &mut AppConfig,
    ) -> Result<(), RagmillError> {
        let Some(existing) = config.source(name).cloned() else {
            return Err(RagmillError::ParserSourceNotConfigured(format!(
                "Source {name:?} is not configured in the workspace."
            )));
        };

        self.manifest.write(name, |snapshot| {
            let module = snapshot.ensure_module(SOURCE_MODULE_KEY);
            module.insert("enabled".to_string(), Value::Bool(enabled));
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })?;

        config.set_source(
            name,
            SourceConfig {
                enabled,
                ..existing
            },
        );
        Ok(())
    }

    /// Record a refresh: timestamp plus a health snapshot under
    /// `modules.source.last_health`.
    pub fn refresh(
        &self,
        name: &str,
        status: HealthStatus,
        summary: Option<&str>,
        actions: &[String],
    ) -> Result<(), RagmillError> {
        let now = now_utc();
        self.manifest.write(name, |snapshot| {
            let module = snapshot.ensure_module(SOURCE_MODULE_KEY);
            module.insert(
                "last_refresh_at".to_string(),
                Value::String(to_rfc3339(now)),
            );
            let mut health = Map::new();
            health.insert(
                "status".to_string(),
                Value::String(status.as_str().to_string()),
            );
            health.insert(
                "checked_at".to_string(),
                Value::String(to_rfc3339(now)),
            );
            if let Some(summary) = summary {
                health.insert("summary".to_string(), Value::String(summary.to_string()));
            }
            health.insert(
                "actions".to_string(),
                Value::Array(
                    actions
                        .iter()
                        .map(|action| Value::String(action.clone()))
                        .collect(),
                ),
            );
            module.insert("last_health".to_string(), Value::Object(health));
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })?;
        Ok(())
    }

    pub fn workspace(&self) -> &WorkspacePaths {
        &self.paths
    }
}

fn default_health_payload(now: OffsetDateTime) -> Value {
    let mut health = Map::new();
    health.insert(
        "status".to_string(),
        Value::String(HealthStatus::Unknown.as_str().to_string()),
    );
    health.insert("checked_at".to_string(), Value::String(to_rfc3339(now)));
    health.insert("actions".to_string(), Value::Array(Vec::new()));
    Value::Object(health)
}

fn parse_status(value: &str) -> Option<HealthStatus> {
    match value {
        "ok" => Some(HealthStatus::Ok),
        "unknown" => Some(HealthStatus::Unknown),
        "degraded" => Some(HealthStatus::Degraded),
        "error" => Some(HealthStatus::Error),
        _ => None,
    }
}
