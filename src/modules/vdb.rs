//! Vector index persistence envelope and embedding-provider contract.
//!
//! Index persistence is a two-file unit: the opaque serialized index and a
//! sibling JSON sidecar describing provider, model, dimension, and a
//! checksum of the index bytes. Writes are atomic per file; a sidecar
//! failure after the index replace removes the new index so the pair never
//! diverges. Provider calls retry with exponential backoff and
//! multiplicative jitter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

use crate::core::error::RagmillError;
use crate::core::time::to_rfc3339;

/// Sidecar file suffix next to the serialized index.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Current sidecar schema version.
pub const SIDECAR_VERSION: u32 = 1;

/// Distance metric recorded in the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdbMetric {
    L2,
    Ip,
    Cosine,
}

/// Sidecar metadata persisted next to `index.faiss`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdbSidecar {
    pub version: u32,
    pub provider: String,
    pub model_id: i64,
    pub model_name: String,
    pub dim: usize,
    pub metric: VdbMetric,
    pub index_type: String,
    pub vector_count: usize,
    pub built_at: String,
    pub checksum: String,
    pub vdb_id: i64,
}

impl VdbSidecar {
    /// Build a sidecar for `index_bytes` with the checksum filled in.
    #[allow(clippy::too_many_arguments)]
    pub fn for_index(
        index_bytes: &[u8],
        provider: &str,
        model_id: i64,
        model_name: &str,
        dim: usize,
        metric: VdbMetric,
        index_type: &str,
        vector_count: usize,
        built_at: OffsetDateTime,
        vdb_id: i64,
    ) -> Self {
        let mut digest = Sha256::new();
        digest.update(index_bytes);
        Self {
            version: SIDECAR_VERSION,
            provider: provider.to_string(),
            model_id,
            model_name: model_name.to_string(),
            dim,
            metric,
            index_type: index_type.to_string(),
            vector_count,
            built_at: to_rfc3339(built_at),
            checksum: format!("{:x}", digest.finalize()),
            vdb_id,
        }
    }
}

/// Sidecar path for an index file (`index.faiss` -> `index.faiss.meta.json`).
pub fn sidecar_path(index_path: &Path) -> PathBuf {
    let name = index_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    index_path.with_file_name(format!("{name}{SIDECAR_SUFFIX}"))
}

/// Deterministic index name across a workspace: `<source>:<vdb_name>`.
pub fn selector(source: &str, vdb_name: &str) -> String {
    format!("{source}:{vdb_name}")
}

/// Persist the index + sidecar pair atomically.
///
/// The index replaces first (temp + rename), then the sidecar. If the
/// sidecar write fails the freshly replaced index is removed so readers
/// never observe mismatched artifacts.
pub fn write_index_atomic(
    index_path: &Path,
    index_bytes: &[u8],
    sidecar: &VdbSidecar,
) -> Result<(), RagmillError> {
    if let Some(parent) = index_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = index_path.with_file_name(format!(
        ".{}.tmp-{}",
        index_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        std::process::id()
    ));
    fs::write(&staging, index_bytes)?;
    if let Err(err) = fs::rename(&staging, index_path) {
        let _ = fs::remove_file(&staging);
        return Err(RagmillError::IoError(err));
    }

    let sidecar_target = sidecar_path(index_path);
    let sidecar_result = (|| -> Result<(), RagmillError> {
        let payload = serde_json::to_string_pretty(sidecar)
            .map_err(|err| RagmillError::Provider(format!("sidecar serialization: {err}")))?;
        let staging = sidecar_target.with_file_name(format!(
            ".{}.tmp-{}",
            sidecar_target
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default(),
            std::process::id()
        ));
        fs::write(&staging, payload.as_bytes())?;
        fs::rename(&staging, &sidecar_target).map_err(|err| {
            let _ = fs::remove_file(&staging);
            RagmillError::IoError(err)
        })?;
        Ok(())
    })();

    if let Err(err) = sidecar_result {
        let _ = fs::remove_file(index_path);
        return Err(err);
    }
    Ok(())
}

/// Load and validate a sidecar against its index bytes.
pub fn read_sidecar(index_path: &Path) -> Result<VdbSidecar, RagmillError> {
    let text = fs::read_to_string(sidecar_path(index_path))?;
    let sidecar: VdbSidecar = serde_json::from_str(&text)
        .map_err(|err| RagmillError::Provider(format!("Malformed vdb sidecar: {err}")))?;
    Ok(sidecar)
}

/// Provider-facing error taxonomy. Retryable kinds feed the backoff loop;
/// the final failure preserves the last kind.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider configuration error: {0}")]
    Configuration(String),

    #[error("provider rate limited: {0}")]
    RateLimit(String),

    #[error("transient provider failure: {0}")]
    Retryable(String),

    #[error("provider rejected request: {0}")]
    Request(String),

    #[error("provider retries exceeded after {attempts} attempts: {last}")]
    RetryExceeded { attempts: u32, last: String },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },

    #[error("input too large for model: {0}")]
    InputTooLarge(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimit(_) | ProviderError::Retryable(_))
    }
}

impl From<ProviderError> for RagmillError {
    fn from(err: ProviderError) -> Self {
        RagmillError::Provider(err.to_string())
    }
}

/// Description of a provider model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescription {
    pub provider: String,
    pub name: String,
    pub dim: Option<usize>,
}

/// Provider capability limits consulted when batching requests.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCapabilities {
    pub max_batch_size: usize,
    pub max_parallel_requests: usize,
    pub max_input_tokens: Option<usize>,
    pub max_request_tokens: Option<usize>,
}

/// Options forwarded to `embed_texts`.
#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub dimensions: Option<usize>,
    pub timeout: Option<Duration>,
}

/// Generic embedding provider contract (shape only; wire details live in
/// concrete providers outside the core).
pub trait EmbeddingProvider: Send + Sync {
    fn describe_model(&self, name: &str) -> Result<ModelDescription, ProviderError>;
    fn capabilities(&self, model: Option<&str>) -> ProviderCapabilities;
    fn embed_texts(
        &self,
        texts: &[String],
        model: &str,
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Retry policy: exponential backoff with multiplicative jitter and a
/// maximum-attempt cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (0-based), jittered multiplicatively within
    /// [0.5, 1.5) of the exponential base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 0.5 + (jitter_seed() % 1000) as f64 / 1000.0;
        Duration::from_secs_f64(capped * jitter)
    }
}

fn jitter_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
}

/// Run `operation` under `policy`, sleeping between retryable failures.
/// Non-retryable failures surface immediately; exhausting attempts yields
/// `RetryExceeded` wrapping the last failure.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    mut operation: impl FnMut() -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    let mut last: Option<ProviderError> = None;
    for attempt in 0..policy.max_attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                last = Some(err);
                if attempt + 1 < policy.max_attempts {
                    std::thread::sleep(policy.delay_for(attempt));
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(ProviderError::RetryExceeded {
        attempts: policy.max_attempts,
        last: last
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempts executed".to_string()),
    })
}

/// Effective request concurrency: the minimum of the requested value (or
/// configured default), the provider's parallelism cap, and the machine's
/// cpu count.
pub fn resolve_concurrency(
    requested: Option<usize>,
    configured: usize,
    caps: &ProviderCapabilities,
) -> usize {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested
        .unwrap_or(configured)
        .min(caps.max_parallel_requests)
        .min(cpu_count)
        .max(1)
}

/// Register an embedding model row, returning its id (idempotent on
/// `(provider, name)`).
pub fn register_embedding_model(
    connection: &rusqlite::Connection,
    provider: &str,
    name: &str,
    dim: usize,
) -> Result<i64, RagmillError> {
    connection.execute(
        "INSERT INTO embedding_models (provider, name, dim) VALUES (?1, ?2, ?3)
         ON CONFLICT(provider, name) DO UPDATE SET dim = excluded.dim",
        rusqlite::params![provider, name, dim as i64],
    )?;
    let id = connection.query_row(
        "SELECT id FROM embedding_models WHERE provider = ?1 AND name = ?2",
        rusqlite::params![provider, name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Register a materialized vdb row bound to a batch and model.
pub fn register_vdb(
    connection: &rusqlite::Connection,
    name: &str,
    batch_id: &str,
    embedding_model_id: i64,
    faiss_path: &Path,
    created_at: OffsetDateTime,
) -> Result<i64, RagmillError> {
    connection.execute(
        "INSERT INTO vdbs (name, batch_id, embedding_model_id, faiss_path, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
             batch_id = excluded.batch_id,
             embedding_model_id = excluded.embedding_model_id,
             faiss_path = excluded.faiss_path",
        rusqlite::params![
            name,
            batch_id,
            embedding_model_id,
            faiss_path.to_string_lossy(),
            to_rfc3339(created_at)
        ],
    )?;
    let id = connection.query_row(
        "SELECT id FROM vdbs WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(id)
}
