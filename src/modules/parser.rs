//! Parser orchestration: planning, handler invocation, staging, and
//! manifest recording.
//!
//! Per-file problems (unresolvable handlers, unreadable files) collect into
//! the plan rather than raising; the service only fails source-wide for a
//! disabled module or an unconfigured source.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::core::config::{AppConfig, ParserSettings, PARSER_MODULE_KEY};
use crate::core::error::RagmillError;
use crate::core::health::HealthStatus;
use crate::core::lock::FileLock;
use crate::core::paths::WorkspacePaths;
use crate::core::source::ensure_workspace_path;
use crate::core::time::{now_utc, to_rfc3339};
use crate::core::uuid7::generate_uuid7;
use crate::modules::db::DbLifecycleService;
use crate::modules::handlers::{handler_by_name, HandlerResult, ParseContext};
use crate::modules::hashing::hash_file;
use crate::modules::manifest::ManifestService;
use crate::modules::manifest_migrator::MODULES_VERSION;
use crate::modules::registry::{
    build_default_registry, HandlerRegistry, HandlerSelection, ParserHandlerDescriptor,
};
use crate::modules::staging::parser_transaction;
use crate::modules::tokenizer::{TokenEncoderFactory, DEFAULT_ENCODER};
use crate::modules::traversal::{TraversalScope, TraversalService};

const LOCK_CONTENTION_EPSILON: f64 = 1e-6;

/// Aggregated counters describing the outcome of a parser run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParserRunMetrics {
    #[serde(default)]
    pub files_discovered: u64,
    #[serde(default)]
    pub files_parsed: u64,
    #[serde(default)]
    pub files_reused: u64,
    #[serde(default)]
    pub files_failed: u64,
    #[serde(default)]
    pub chunks_emitted: u64,
    #[serde(default)]
    pub chunks_reused: u64,
    #[serde(default)]
    pub fallbacks: u64,
    #[serde(default)]
    pub queue_depth: u64,
    #[serde(default)]
    pub handlers_invoked: BTreeMap<String, u64>,
    #[serde(default)]
    pub handler_runtime_seconds: BTreeMap<String, f64>,
    #[serde(default)]
    pub lock_wait_seconds: f64,
    #[serde(default)]
    pub lock_contention_events: u64,
}

impl ParserRunMetrics {
    pub fn increment_handler(&mut self, name: &str) {
        *self.handlers_invoked.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_handler_runtime(&mut self, name: &str, seconds: f64) {
        *self
            .handler_runtime_seconds
            .entry(name.to_string())
            .or_insert(0.0) += seconds.max(0.0);
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    /// Accumulate lock wait; waits above a small epsilon count as one
    /// contention event.
    pub fn record_lock_wait(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.lock_wait_seconds += seconds;
        if seconds > LOCK_CONTENTION_EPSILON {
            self.lock_contention_events += 1;
        }
    }
}

/// Planned work item referencing a file and its selected handler.
#[derive(Debug, Clone)]
pub struct ParserPlanEntry {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub handler: ParserHandlerDescriptor,
    pub selection: HandlerSelection,
    pub file_hash: String,
    pub shebang: Option<String>,
}

/// Aggregate of files prepared for parsing.
#[derive(Debug, Clone)]
pub struct ParserBatchPlan {
    pub source: String,
    pub root: PathBuf,
    pub entries: Vec<ParserPlanEntry>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub metrics: ParserRunMetrics,
    pub handler_versions: BTreeMap<String, String>,
}

impl ParserBatchPlan {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Structured summary persisted after a parser run completes.
#[derive(Debug, Clone)]
pub struct ParserRunRecord {
    pub batch_id: Option<String>,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub status: HealthStatus,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
    pub handler_versions: BTreeMap<String, String>,
    pub metrics: ParserRunMetrics,
}

/// Manifest payload persisted under `modules.parser` for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserManifestState {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_batch_id: Option<String>,
    #[serde(default)]
    pub last_run_started_at: Option<String>,
    #[serde(default)]
    pub last_run_completed_at: Option<String>,
    #[serde(default = "default_status")]
    pub last_run_status: HealthStatus,
    #[serde(default)]
    pub last_run_summary: Option<String>,
    #[serde(default)]
    pub last_run_warnings: Vec<String>,
    #[serde(default)]
    pub last_run_errors: Vec<String>,
    #[serde(default)]
    pub last_run_notes: Vec<String>,
    #[serde(default)]
    pub handler_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: ParserRunMetrics,
}

fn default_enabled() -> bool {
    true
}

fn default_status() -> HealthStatus {
    HealthStatus::Unknown
}

impl Default for ParserManifestState {
    fn default() -> Self {
        Self {
            enabled: true,
            last_batch_id: None,
            last_run_started_at: None,
            last_run_completed_at: None,
            last_run_status: HealthStatus::Unknown,
            last_run_summary: None,
            last_run_warnings: Vec::new(),
            last_run_errors: Vec::new(),
            last_run_notes: Vec::new(),
            handler_versions: BTreeMap::new(),
            metrics: ParserRunMetrics::default(),
        }
    }
}

impl ParserManifestState {
    pub fn from_value(payload: Option<&serde_json::Map<String, Value>>) -> Self {
        match payload {
            Some(map) => serde_json::from_value(Value::Object(map.clone())).unwrap_or_default(),
            None => Self::default(),
        }
    }

    pub fn to_value(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Copy updated with the latest parser run.
    pub fn apply_run(&self, run: &ParserRunRecord, enabled: bool) -> Self {
        Self {
            enabled,
            last_batch_id: run.batch_id.clone(),
            last_run_started_at: Some(to_rfc3339(run.started_at)),
            last_run_completed_at: run.completed_at.map(to_rfc3339),
            last_run_status: run.status,
            last_run_summary: run.summary.clone(),
            last_run_warnings: run.warnings.clone(),
            last_run_errors: run.errors.clone(),
            last_run_notes: run.notes.clone(),
            handler_versions: run.handler_versions.clone(),
            metrics: run.metrics.clone(),
        }
    }
}

/// Facade coordinating parser planning, execution, and manifest IO.
pub struct ParserService {
    paths: WorkspacePaths,
    config: AppConfig,
    settings: ParserSettings,
    manifest: ManifestService,
    registry: HandlerRegistry,
    encoder_factory: TokenEncoderFactory,
    encoder_name: String,
}

impl ParserService {
    pub fn new(paths: WorkspacePaths, config: AppConfig) -> Result<Self, RagmillError> {
        let settings = config.parser.clone();
        let manifest = ManifestService::new(paths.clone(), config.manifest.clone());
        let registry = build_default_registry(settings.clone())?;
        Ok(Self {
            paths,
            config,
            settings,
            manifest,
            registry,
            encoder_factory: TokenEncoderFactory::new(),
            encoder_name: DEFAULT_ENCODER.to_string(),
        })
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.settings
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn manifest_service(&self) -> &ManifestService {
        &self.manifest
    }

    /// Plan parsing work for `source`, returning discovered files with
    /// selected handlers and content hashes.
    pub fn plan_source(
        &self,
        source: &str,
        scope: Option<&TraversalScope>,
    ) -> Result<ParserBatchPlan, RagmillError> {
        if !self.settings.enabled {
            return Err(RagmillError::ParserModuleDisabled(
                "Parser module is disabled.".to_string(),
            ));
        }
        let source_config = self.config.source(source).ok_or_else(|| {
            RagmillError::ParserSourceNotConfigured(format!(
                "Source {source:?} is not configured in the workspace."
            ))
        })?;
        let root = source_config.path.clone();

        let traversal = TraversalService::new(
            &root,
            self.settings.gitignore_behavior,
            &self.config.ignore_patterns,
            false,
        )?;

        let mut metrics = ParserRunMetrics::default();
        let mut warnings: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut entries: Vec<ParserPlanEntry> = Vec::new();

        for availability in self.registry.availability() {
            if !availability.enabled || availability.status == HealthStatus::Ok {
                continue;
            }
            let detail = availability
                .summary
                .clone()
                .unwrap_or_else(|| availability.status.to_string());
            warnings.push(format!("Handler {} degraded: {detail}", availability.name));
        }

        for discovered in traversal.iter_files(scope) {
            metrics.files_discovered += 1;
            let relative = discovered.relative_path.to_string_lossy().replace('\\', "/");
            let shebang = read_shebang(&discovered.absolute_path);

            let selection =
                match self
                    .registry
                    .resolve(&discovered.absolute_path, None, shebang.as_deref())
                {
                    Ok(selection) => selection,
                    Err(err) => {
                        errors.push(format!("No handler available for {relative}: {err}"));
                        metrics.files_failed += 1;
                        continue;
                    }
                };
            let handler = selection.handler.clone();
            if selection.fallback {
                metrics.record_fallback();
                warnings.push(format!(
                    "Fallback to {} for {relative} via {}",
                    handler.name, selection.resolved_via
                ));
            }

            let file_hash = match hash_file(
                &discovered.absolute_path,
                &handler.version,
                &[relative.as_bytes()],
            ) {
                Ok(hash) => hash,
                Err(err) => {
                    errors.push(format!("Failed to hash {relative}: {err}"));
                    metrics.files_failed += 1;
                    continue;
                }
            };

            metrics.files_parsed += 1;
            metrics.increment_handler(&handler.name);
            entries.push(ParserPlanEntry {
                absolute_path: discovered.absolute_path,
                relative_path: discovered.relative_path,
                handler,
                selection,
                file_hash,
                shebang,
            });
        }

        Ok(ParserBatchPlan {
            source: source.to_string(),
            root,
            entries,
            warnings: dedupe(warnings),
            errors: dedupe(errors),
            metrics,
            handler_versions: self.registry.handler_versions(),
        })
    }

    /// Invoke handlers for every plan entry inside a bounded worker pool.
    /// Returns results aligned with `plan.entries` plus per-handler
    /// runtimes merged into a metrics delta.
    pub fn execute_plan(
        &self,
        plan: &ParserBatchPlan,
    ) -> Result<(Vec<HandlerResult>, ParserRunMetrics), RagmillError> {
        let encoder = self
            .encoder_factory
            .get(&self.encoder_name)
            .unwrap_or_else(|_| self.encoder_factory.fallback(&self.encoder_name));

        let workers = self.settings.max_concurrency.resolve().max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|err| RagmillError::ParserError(format!("worker pool: {err}")))?;

        let outputs: Vec<(String, f64, HandlerResult)> = pool.install(|| {
            plan.entries
                .par_iter()
                .map(|entry| {
                    let context = ParseContext {
                        source: &plan.source,
                        root: &plan.root,
                        settings: &self.settings,
                        encoder: &encoder,
                    };
                    let started = Instant::now();
                    let result = match handler_by_name(&entry.handler.name) {
                        Some(handler) => handler.parse(&entry.absolute_path, &context),
                        None => {
                            let file = crate::modules::handlers::HandlerFile::new(
                                &entry.absolute_path,
                                &entry.handler.name,
                            );
                            HandlerResult::empty(
                                file,
                                vec![format!(
                                    "Handler {:?} has no implementation",
                                    entry.handler.name
                                )],
                            )
                        }
                    };
                    (
                        entry.handler.name.clone(),
                        started.elapsed().as_secs_f64(),
                        result,
                    )
                })
                .collect()
        });

        let mut delta = ParserRunMetrics::default();
        delta.queue_depth = plan.entries.len() as u64;
        let mut results = Vec::with_capacity(outputs.len());
        for (handler, seconds, result) in outputs {
            delta.record_handler_runtime(&handler, seconds);
            results.push(result);
        }
        Ok((results, delta))
    }

    /// Stage handler results into the source database for `batch_id`.
    ///
    /// Returns the plan metrics augmented with staging counts: files whose
    /// chunks were all reused count as `files_reused` instead of
    /// `files_parsed`, and lock wait feeds the contention counters.
    pub fn stage_batch(
        &self,
        db: &DbLifecycleService,
        source: &str,
        batch_id: &str,
        plan: &ParserBatchPlan,
        results: &[HandlerResult],
        batch_ref: Option<&str>,
    ) -> Result<ParserRunMetrics, RagmillError> {
        let mut metrics = plan.metrics.clone();
        let generated_at = now_utc();

        let handler_versions: rustc_hash::FxHashMap<String, String> = plan
            .handler_versions
            .iter()
            .map(|(name, version)| (name.clone(), version.clone()))
            .collect();

        let (per_file, lock_wait) = parser_transaction(db, source, |session| {
            session.ensure_batch(batch_id, batch_ref, generated_at, None)?;

            let mut outcomes = Vec::with_capacity(plan.entries.len());
            for (entry, result) in plan.entries.iter().zip(results.iter()) {
                let outcome = session.stage_file(
                    batch_id,
                    &entry.relative_path,
                    &entry.handler.name,
                    &entry.file_hash,
                    &entry.handler.name,
                    &entry.handler.version,
                    &handler_versions,
                    result,
                    Some(&entry.absolute_path),
                )?;
                outcomes.push((result.chunks.len(), outcome));
            }
            Ok(outcomes)
        })?;

        metrics.record_lock_wait(lock_wait);
        for (chunk_count, outcome) in per_file {
            metrics.chunks_emitted += outcome.chunks_inserted as u64;
            metrics.chunks_reused += outcome.chunks_reused as u64;
            if chunk_count > 0 && outcome.chunks_inserted == 0 && outcome.chunks_reused > 0 {
                metrics.files_reused += 1;
                metrics.files_parsed = metrics.files_parsed.saturating_sub(1);
            }
        }
        Ok(metrics)
    }

    /// Run plan, handlers, staging, and manifest recording end to end.
    pub fn parse_source(
        &self,
        db: &DbLifecycleService,
        source: &str,
        scope: Option<&TraversalScope>,
        batch_ref: Option<&str>,
    ) -> Result<ParserRunRecord, RagmillError> {
        let started_at = now_utc();
        let _parser_lock = self.parser_lock(source)?;

        let plan = self.plan_source(source, scope)?;
        let batch_id = generate_uuid7(started_at)?.to_string();
        let (results, execution_delta) = self.execute_plan(&plan)?;

        let mut run_errors: Vec<String> = Vec::new();
        let mut run_warnings: Vec<String> = Vec::new();
        for (entry, result) in plan.entries.iter().zip(results.iter()) {
            let relative = entry.relative_path.to_string_lossy();
            for warning in &result.warnings {
                run_warnings.push(format!("{relative}: {warning}"));
            }
            for error in &result.errors {
                run_errors.push(format!("{relative}: {error}"));
            }
        }

        let mut metrics = self.stage_batch(db, source, &batch_id, &plan, &results, batch_ref)?;
        metrics.queue_depth = execution_delta.queue_depth;
        for (handler, seconds) in &execution_delta.handler_runtime_seconds {
            metrics.record_handler_runtime(handler, *seconds);
        }

        let run = self.build_run_record(
            &plan,
            Some(batch_id),
            None,
            run_warnings,
            run_errors,
            Vec::new(),
            Some(started_at),
            Some(now_utc()),
            Some(metrics),
        );
        self.record_run(source, &run)?;
        Ok(run)
    }

    /// Combine planning metadata with run-time information. Status derives
    /// from collected errors/warnings when not supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn build_run_record(
        &self,
        plan: &ParserBatchPlan,
        batch_id: Option<String>,
        status: Option<HealthStatus>,
        warnings: Vec<String>,
        errors: Vec<String>,
        notes: Vec<String>,
        started_at: Option<OffsetDateTime>,
        completed_at: Option<OffsetDateTime>,
        metrics: Option<ParserRunMetrics>,
    ) -> ParserRunRecord {
        let mut aggregated_warnings = plan.warnings.clone();
        aggregated_warnings.extend(warnings);
        let mut aggregated_errors = plan.errors.clone();
        aggregated_errors.extend(errors);

        let started = started_at.unwrap_or_else(now_utc);
        let status = status.unwrap_or({
            if !aggregated_errors.is_empty() {
                HealthStatus::Error
            } else if !aggregated_warnings.is_empty() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            }
        });

        ParserRunRecord {
            batch_id,
            started_at: started,
            completed_at: Some(completed_at.unwrap_or(started)),
            status,
            summary: None,
            warnings: dedupe(aggregated_warnings),
            errors: dedupe(aggregated_errors),
            notes,
            handler_versions: plan.handler_versions.clone(),
            metrics: metrics.unwrap_or_else(|| plan.metrics.clone()),
        }
    }

    /// Persist `run` details into the source manifest.
    pub fn record_run(
        &self,
        source: &str,
        run: &ParserRunRecord,
    ) -> Result<ParserManifestState, RagmillError> {
        let enabled = self.settings.enabled;
        let snapshot = self.manifest.write(source, |snapshot| {
            let current =
                ParserManifestState::from_value(snapshot.module(PARSER_MODULE_KEY));
            let updated = current.apply_run(run, enabled);
            let modules = snapshot.ensure_modules();
            modules.insert(
                PARSER_MODULE_KEY.to_string(),
                Value::Object(updated.to_value()),
            );
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })?;
        Ok(ParserManifestState::from_value(
            snapshot.module(PARSER_MODULE_KEY),
        ))
    }

    /// Persisted parser manifest payload for `source`.
    pub fn load_manifest_state(&self, source: &str) -> Result<ParserManifestState, RagmillError> {
        let snapshot = self.manifest.load(source, true, false)?;
        Ok(ParserManifestState::from_value(
            snapshot.module(PARSER_MODULE_KEY),
        ))
    }

    /// Handler availability pairs for health readouts.
    pub fn handler_availability(&self) -> Vec<(String, HealthStatus)> {
        self.registry
            .availability()
            .into_iter()
            .map(|snapshot| (snapshot.name, snapshot.status))
            .collect()
    }

    /// Serialize concurrent parse requests for the same source.
    fn parser_lock(&self, source: &str) -> Result<FileLock, RagmillError> {
        let key = source.replace(['/', '\\'], "_");
        let path = self
            .paths
            .locks_dir()
            .join("parser")
            .join(format!("{key}.lock"));
        let mut lock = FileLock::new(
            path,
            self.config.db.lock_timeout,
            self.config.db.lock_poll_interval,
        );
        lock.acquire().map_err(|err| match err {
            RagmillError::LockTimeout(message) => {
                RagmillError::LockTimeout(format!("parser parse for {source:?}: {message}"))
            }
            other => other,
        })?;
        Ok(lock)
    }

    /// Validate an explicit scope path against the source root.
    pub fn normalize_scope(
        &self,
        source: &str,
        paths: &[PathBuf],
    ) -> Result<Option<TraversalScope>, RagmillError> {
        if paths.is_empty() {
            return Ok(None);
        }
        let source_config = self.config.source(source).ok_or_else(|| {
            RagmillError::ParserSourceNotConfigured(format!(
                "Source {source:?} is not configured in the workspace."
            ))
        })?;
        let mut resolved = Vec::new();
        for path in paths {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                source_config.path.join(path)
            };
            if let Ok(valid) = ensure_workspace_path(&source_config.path, &absolute) {
                resolved.push(valid);
            }
        }
        Ok(Some(TraversalScope::from_paths(resolved)))
    }
}

fn read_shebang(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buffer = [0u8; 256];
    let read = file.read(&mut buffer).ok()?;
    let prefix = &buffer[..read];
    if !prefix.starts_with(b"#!") {
        return None;
    }
    let line = prefix.split(|byte| *byte == b'\n').next()?;
    Some(String::from_utf8_lossy(line).trim().to_string())
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lock_wait_threshold() {
        let mut metrics = ParserRunMetrics::default();
        metrics.record_lock_wait(0.0);
        assert_eq!(metrics.lock_contention_events, 0);
        metrics.record_lock_wait(0.5);
        assert_eq!(metrics.lock_contention_events, 1);
        assert!(metrics.lock_wait_seconds > 0.49);
    }

    #[test]
    fn test_manifest_state_round_trip() {
        let mut state = ParserManifestState::default();
        state.last_batch_id = Some("abc".to_string());
        state.metrics.files_parsed = 3;
        let value = state.to_value();
        let parsed = ParserManifestState::from_value(Some(&value));
        assert_eq!(parsed.last_batch_id.as_deref(), Some("abc"));
        assert_eq!(parsed.metrics.files_parsed, 3);
    }

    #[test]
    fn test_dedupe_preserves_order() {
        let values = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedupe(values), vec!["b".to_string(), "a".to_string()]);
    }
}
