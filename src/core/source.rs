//! Source identifiers and path validation.
//!
//! Every component that accepts user-supplied names or paths routes through
//! these helpers: slugs bound directory names and config keys, and subtree
//! validation keeps user paths inside permitted roots.

use std::path::{Path, PathBuf};

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::core::error::RagmillError;
use crate::core::paths::{expand_tilde, normalize_path, WorkspacePaths};

fn slug_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap())
}

/// Normalize arbitrary input into a lowercase kebab-case slug.
///
/// Trims surrounding whitespace, decomposes unicode (NFKD) down to ASCII,
/// lowercases, then joins runs of `[a-z0-9]+` with `-`. Input with no
/// alphanumeric content is an error.
pub fn normalize_source_slug(raw: &str) -> Result<String, RagmillError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RagmillError::SlugError(
            "Source name cannot be empty.".to_string(),
        ));
    }

    let ascii_only: String = trimmed.nfkd().filter(char::is_ascii).collect();
    let lowercase = ascii_only.to_lowercase();
    let tokens: Vec<&str> = slug_token_pattern()
        .find_iter(&lowercase)
        .map(|m| m.as_str())
        .collect();
    if tokens.is_empty() {
        return Err(RagmillError::SlugError(
            "Source name must include alphanumeric characters.".to_string(),
        ));
    }
    Ok(tokens.join("-"))
}

/// Ensure `candidate` stays within the `base` subtree after normalization.
pub fn ensure_workspace_path(base: &Path, candidate: &Path) -> Result<PathBuf, RagmillError> {
    let base_path = normalize_path(&expand_tilde(base));
    let candidate_path = normalize_path(&expand_tilde(candidate));

    if candidate_path.starts_with(&base_path) {
        return Ok(candidate_path);
    }
    Err(RagmillError::PathError(format!(
        "Path {} is outside of workspace subtree {}.",
        candidate_path.display(),
        base_path.display()
    )))
}

/// Reference to a workspace source and its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub name: String,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
}

impl SourceRef {
    pub fn from_workspace(workspace: &WorkspacePaths, name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: workspace.source_dir(name),
            manifest_path: workspace.source_manifest_path(name),
        }
    }

    /// Ensure the source directory exists on disk.
    pub fn ensure_directories(&self) -> Result<(), RagmillError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
