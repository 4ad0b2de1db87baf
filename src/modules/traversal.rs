//! Filesystem traversal honoring ignore rules.
//!
//! Walks a source root producing `(absolute, relative)` paths for regular
//! files. Repo mode keeps a stack of `.gitignore` matchers (one per
//! ancestor or visited directory); workspace mode applies a static pattern
//! list from configuration; `combined` applies both. Deeper gitignore
//! entries override shallower ones, and `!` negations re-include.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::core::config::GitignoreBehavior;
use crate::core::error::RagmillError;
use crate::core::paths::normalize_path;

/// Explicit traversal constraints for a source target.
#[derive(Debug, Clone, Default)]
pub struct TraversalScope {
    pub include: Vec<PathBuf>,
}

impl TraversalScope {
    pub fn from_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> Self {
        let mut include = Vec::new();
        for path in paths {
            let normalized = normalize_path(&path);
            if !include.contains(&normalized) {
                include.push(normalized);
            }
        }
        Self { include }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }
}

/// A file discovered during traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalEntry {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
}

/// Enumerate files under a source while respecting ignore rules.
pub struct TraversalService {
    root: PathBuf,
    workspace_spec: Option<Gitignore>,
    repo_enabled: bool,
    follow_symlinks: bool,
}

impl TraversalService {
    pub fn new(
        root: &Path,
        behavior: GitignoreBehavior,
        workspace_patterns: &[String],
        follow_symlinks: bool,
    ) -> Result<Self, RagmillError> {
        if !root.exists() {
            return Err(RagmillError::PathError(format!(
                "Traversal root not found: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(RagmillError::PathError(format!(
                "Traversal root must be a directory: {}",
                root.display()
            )));
        }
        let root = normalize_path(root);

        let workspace_spec = if behavior.workspace_enabled() && !workspace_patterns.is_empty() {
            let mut builder = GitignoreBuilder::new(&root);
            for pattern in workspace_patterns {
                builder.add_line(None, pattern).map_err(|err| {
                    RagmillError::ConfigError(format!(
                        "Invalid workspace ignore pattern {pattern:?}: {err}"
                    ))
                })?;
            }
            Some(builder.build().map_err(|err| {
                RagmillError::ConfigError(format!("Failed building workspace ignore spec: {err}"))
            })?)
        } else {
            None
        };

        Ok(Self {
            root,
            workspace_spec,
            repo_enabled: behavior.repo_enabled(),
            follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Yield files within the traversal scope honoring ignore rules.
    ///
    /// Scope paths outside the root are silently skipped; scope
    /// directories walk recursively; scope files are yielded after ignore
    /// checks. Without a scope the walk starts at the root.
    pub fn iter_files(&self, scope: Option<&TraversalScope>) -> Vec<TraversalEntry> {
        let mut out = Vec::new();
        match scope {
            Some(scope) if !scope.is_empty() => {
                for path in &scope.include {
                    if !path.exists() || !path.starts_with(&self.root) {
                        continue;
                    }
                    if path.is_dir() {
                        let stack = self.ancestor_specs(path);
                        self.walk(path, &stack, &mut out);
                    } else if path.is_file() {
                        let stack = self.ancestor_specs(path.parent().unwrap_or(&self.root));
                        if !self.is_ignored(path, false, &stack) {
                            out.push(self.entry_for(path));
                        }
                    }
                }
            }
            _ => {
                self.walk(&self.root.clone(), &[], &mut out);
            }
        }
        out
    }

    fn walk(&self, directory: &Path, stack: &[Gitignore], out: &mut Vec<TraversalEntry>) {
        let mut stack: Vec<Gitignore> = stack.to_vec();
        if let Some(spec) = self.load_gitignore(directory) {
            stack.push(spec);
        }

        let Ok(reader) = std::fs::read_dir(directory) else {
            return;
        };
        let mut entries: Vec<PathBuf> = reader
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            let Ok(file_type) = std::fs::symlink_metadata(&entry).map(|meta| meta.file_type())
            else {
                continue;
            };
            if file_type.is_symlink() && !self.follow_symlinks {
                continue;
            }
            let is_dir = entry.is_dir();
            if self.is_ignored(&entry, is_dir, &stack) {
                continue;
            }
            if is_dir {
                self.walk(&entry, &stack, out);
            } else if entry.is_file() {
                out.push(self.entry_for(&entry));
            }
        }
    }

    fn entry_for(&self, path: &Path) -> TraversalEntry {
        let relative = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());
        TraversalEntry {
            absolute_path: path.to_path_buf(),
            relative_path: relative,
        }
    }

    /// Matchers for every `.gitignore` between the root and `directory`,
    /// shallowest first.
    fn ancestor_specs(&self, directory: &Path) -> Vec<Gitignore> {
        let mut lineage = Vec::new();
        let mut current = directory.to_path_buf();
        loop {
            lineage.push(current.clone());
            if current == self.root {
                break;
            }
            let Some(parent) = current.parent() else {
                break;
            };
            current = parent.to_path_buf();
        }
        lineage.reverse();

        lineage
            .iter()
            .filter_map(|ancestor| self.load_gitignore(ancestor))
            .collect()
    }

    fn is_ignored(&self, path: &Path, is_dir: bool, stack: &[Gitignore]) -> bool {
        if let Some(spec) = &self.workspace_spec {
            if spec.matched(path, is_dir).is_ignore() {
                return true;
            }
        }

        // Deeper gitignores take precedence; whitelist entries re-include.
        let mut decision: Option<bool> = None;
        for spec in stack {
            let matched = spec.matched(path, is_dir);
            if matched.is_ignore() {
                decision = Some(true);
            } else if matched.is_whitelist() {
                decision = Some(false);
            }
        }
        decision.unwrap_or(false)
    }

    fn load_gitignore(&self, directory: &Path) -> Option<Gitignore> {
        if !self.repo_enabled {
            return None;
        }
        let gitignore = directory.join(".gitignore");
        if !gitignore.is_file() {
            return None;
        }
        let mut builder = GitignoreBuilder::new(directory);
        builder.add(&gitignore);
        builder.build().ok()
    }
}
