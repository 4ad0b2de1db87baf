//! Error types for ragmill operations.
//!
//! This module defines the canonical error type used throughout ragmill.
//! All subsystems return `Result<T, RagmillError>` for error handling.

use std::io;
use thiserror::Error;

/// Canonical error type for all ragmill operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait
/// implementations. Variants that wrap standard library or `rusqlite`
/// errors auto-convert via `#[from]`.
#[derive(Error, Debug)]
pub enum RagmillError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Source name could not be normalized into a slug
    #[error("Slug error: {0}")]
    SlugError(String),

    /// Path resolution or subtree validation error
    #[error("Path error: {0}")]
    PathError(String),

    /// Lock acquisition timed out. Callers may retry with their own policy.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Lock acquisition or release failed for a non-timeout reason.
    #[error("Lock error: {0}")]
    LockError(String),

    /// Manifest could not be read (missing files are not errors; malformed
    /// documents are).
    #[error("Manifest read error: {0}")]
    ManifestRead(String),

    /// Manifest staging or rename failed.
    #[error("Manifest write error: {0}")]
    ManifestWrite(String),

    /// Manifest transaction persistence failed after the body succeeded.
    #[error("Manifest transaction error: {0}")]
    ManifestTransaction(String),

    /// Manifest backup rotation failed.
    #[error("Manifest backup error: {0}")]
    ManifestBackup(String),

    /// Database lifecycle precondition failed.
    #[error("DB lifecycle error: {0}")]
    DbLifecycle(String),

    /// A database backend operation failed.
    #[error("DB operation error: {0}")]
    DbOperation(String),

    /// Mirroring lifecycle state into the manifest failed.
    #[error("DB manifest sync error: {0}")]
    DbManifestSync(String),

    /// Migration resources are malformed or inconsistent.
    #[error("Migration load error: {0}")]
    MigrationLoad(String),

    /// Parser operation attempted while the module is disabled.
    #[error("Parser module disabled: {0}")]
    ParserModuleDisabled(String),

    /// Parser operation targeted an unconfigured source.
    #[error("Source not configured: {0}")]
    ParserSourceNotConfigured(String),

    /// Parser-level failure outside the per-file error collection.
    #[error("Parser error: {0}")]
    ParserError(String),

    /// Token encoder could not be loaded.
    #[error("Token encoder error: {0}")]
    TokenEncoder(String),

    /// Embedding provider failure surfaced at a lifecycle boundary.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Feature not yet implemented (placeholder backends)
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}
