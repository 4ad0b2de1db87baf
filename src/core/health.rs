//! Health status primitives and the workspace-wide aggregator.
//!
//! Health is always derived, never stored as truth: module hooks inspect
//! manifests and databases and return reports; the aggregator persists a
//! snapshot document at the workspace root.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::error::RagmillError;
use crate::core::paths::WorkspacePaths;
use crate::core::time::to_rfc3339;

/// Severity-ordered status: `ok < unknown < degraded < error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unknown,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn severity(self) -> u8 {
        match self {
            HealthStatus::Ok => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Error => 3,
        }
    }

    /// Returns the more severe of `self` and `candidate`.
    pub fn elevate(self, candidate: HealthStatus) -> HealthStatus {
        if candidate.severity() > self.severity() {
            candidate
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report emitted by a module health hook for one subject (usually a source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub last_refresh_at: Option<String>,
}

impl HealthReport {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            summary: None,
            actions: Vec::new(),
            last_refresh_at: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_last_refresh(mut self, at: Option<OffsetDateTime>) -> Self {
        self.last_refresh_at = at.map(to_rfc3339);
        self
    }
}

/// Per-module entry persisted in the workspace health document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub status: HealthStatus,
    pub checked_at: String,
    pub details: Vec<HealthReport>,
}

impl ModuleHealth {
    pub fn from_reports(details: Vec<HealthReport>, checked_at: OffsetDateTime) -> Self {
        let status = details
            .iter()
            .fold(HealthStatus::Ok, |acc, report| acc.elevate(report.status));
        Self {
            status,
            checked_at: to_rfc3339(checked_at),
            details,
        }
    }
}

/// Persist the workspace health document (`.health.json`).
///
/// Modules present in the previous document but not selected in this
/// invocation are carried forward verbatim. The write is atomic via
/// temp-plus-rename; no backup rotation. Callers are expected to run this
/// from a single controller process.
pub fn write_health_document(
    paths: &WorkspacePaths,
    modules: &BTreeMap<String, Vec<HealthReport>>,
    now: OffsetDateTime,
) -> Result<PathBuf, RagmillError> {
    let target = paths.health_file();

    let mut document: serde_json::Map<String, serde_json::Value> = match fs::read_to_string(&target)
    {
        Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).unwrap_or_default(),
        _ => serde_json::Map::new(),
    };

    for (module, reports) in modules {
        let entry = ModuleHealth::from_reports(reports.clone(), now);
        let value = serde_json::to_value(entry)
            .map_err(|err| RagmillError::ManifestWrite(format!("health serialization: {err}")))?;
        document.insert(module.clone(), value);
    }

    let payload = serde_json::to_string_pretty(&serde_json::Value::Object(document))
        .map_err(|err| RagmillError::ManifestWrite(format!("health serialization: {err}")))?;

    fs::create_dir_all(&paths.workspace)?;
    let staging = target.with_file_name(format!(
        "{}.tmp-{}",
        paths.health_file().file_name().unwrap().to_string_lossy(),
        std::process::id()
    ));
    fs::write(&staging, payload.as_bytes())?;
    if let Err(err) = fs::rename(&staging, &target) {
        let _ = fs::remove_file(&staging);
        return Err(RagmillError::ManifestWrite(format!(
            "Failed writing health document at {}: {err}",
            target.display()
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(HealthStatus::Ok.severity() < HealthStatus::Unknown.severity());
        assert!(HealthStatus::Unknown.severity() < HealthStatus::Degraded.severity());
        assert!(HealthStatus::Degraded.severity() < HealthStatus::Error.severity());
    }

    #[test]
    fn test_elevate_keeps_most_severe() {
        let status = HealthStatus::Ok
            .elevate(HealthStatus::Degraded)
            .elevate(HealthStatus::Unknown);
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn test_module_health_takes_max_severity() {
        let details = vec![
            HealthReport::new("a", HealthStatus::Ok),
            HealthReport::new("b", HealthStatus::Error),
        ];
        let entry = ModuleHealth::from_reports(details, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(entry.status, HealthStatus::Error);
    }
}
