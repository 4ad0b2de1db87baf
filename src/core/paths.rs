//! Workspace path resolution and canonical layout.
//!
//! A workspace is a directory holding the configuration file, `logs/`,
//! `archives/`, `sources/` (one subdirectory per managed source), a
//! `.locks/` namespace, and the workspace health document.

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::core::error::RagmillError;

/// Environment variable honored when no explicit workspace is supplied.
pub const WORKSPACE_ENV_VAR: &str = "RAGMILL_WORKSPACE";

/// Name of the workspace configuration document.
pub const CONFIG_FILE_NAME: &str = "ragmill.toml";

/// Name of the workspace-wide health document.
pub const HEALTH_FILE_NAME: &str = ".health.json";

/// Resolved locations for a workspace instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub workspace: PathBuf,
    pub config_file: PathBuf,
    pub logs_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub sources_dir: PathBuf,
}

impl WorkspacePaths {
    /// Directory holding a named source's manifest, database, and vectors.
    pub fn source_dir(&self, name: &str) -> PathBuf {
        self.sources_dir.join(name)
    }

    pub fn source_manifest_path(&self, name: &str) -> PathBuf {
        self.source_dir(name).join("manifest.json")
    }

    pub fn source_database_path(&self, name: &str) -> PathBuf {
        self.source_dir(name).join("db.sqlite3")
    }

    /// Root of the namespaced lockfile tree (`.locks/db/<slug>.lock`).
    pub fn locks_dir(&self) -> PathBuf {
        self.workspace.join(".locks")
    }

    pub fn health_file(&self) -> PathBuf {
        self.workspace.join(HEALTH_FILE_NAME)
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_layout(&self) -> Result<(), RagmillError> {
        for dir in [
            &self.workspace,
            &self.logs_dir,
            &self.archives_dir,
            &self.sources_dir,
            &self.locks_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Resolve canonical workspace locations.
///
/// Precedence: explicit override > environment override > `~/.ragmill`.
/// `~` is expanded and relative paths are normalized against the current
/// working directory. The only failure is a workspace path that already
/// exists as a regular file.
pub fn resolve_workspace(
    workspace_override: Option<&Path>,
    env_override: Option<&Path>,
) -> Result<WorkspacePaths, RagmillError> {
    let base = match (workspace_override, env_override) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => path.to_path_buf(),
        (None, None) => home_dir().join(".ragmill"),
    };
    let workspace = normalize_path(&expand_tilde(&base));

    if workspace.exists() && workspace.is_file() {
        return Err(RagmillError::PathError(format!(
            "Workspace file path not allowed: {}",
            workspace.display()
        )));
    }

    Ok(WorkspacePaths {
        config_file: workspace.join(CONFIG_FILE_NAME),
        logs_dir: workspace.join("logs"),
        archives_dir: workspace.join("archives"),
        sources_dir: workspace.join("sources"),
        workspace,
    })
}

/// Resolve the workspace honoring `RAGMILL_WORKSPACE` when no explicit
/// override is supplied.
pub fn resolve_workspace_from_env(
    workspace_override: Option<&Path>,
) -> Result<WorkspacePaths, RagmillError> {
    let env_value = env::var_os(WORKSPACE_ENV_VAR).map(PathBuf::from);
    resolve_workspace(workspace_override, env_value.as_deref())
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" {
        return home_dir();
    }
    if let Some(rest) = text.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    path.to_path_buf()
}

/// Lexical normalization: absolutize against cwd and fold `.`/`..`
/// components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_source_paths() {
        let paths = resolve_workspace(Some(Path::new("/tmp/ragmill-ws")), None).unwrap();
        assert_eq!(
            paths.source_manifest_path("alpha"),
            PathBuf::from("/tmp/ragmill-ws/sources/alpha/manifest.json")
        );
        assert_eq!(
            paths.source_database_path("alpha"),
            PathBuf::from("/tmp/ragmill-ws/sources/alpha/db.sqlite3")
        );
    }

    #[test]
    fn test_explicit_override_wins_over_env() {
        let paths = resolve_workspace(
            Some(Path::new("/tmp/explicit")),
            Some(Path::new("/tmp/from-env")),
        )
        .unwrap();
        assert_eq!(paths.workspace, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn test_normalize_folds_dot_segments() {
        let normalized = normalize_path(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }
}
