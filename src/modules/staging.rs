//! Transactional staging of handler results into the per-source store.
//!
//! Staging runs inside one SQLite transaction per batch, held under the
//! per-source DB lock. Files upsert by `repo_path`; symbols compare against
//! their prior row and either touch `last_seen_batch`, update in place, or
//! insert; chunks flow through the write pipeline.

use std::path::Path;
use std::time::Instant;

use rusqlite::{Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde_json::Value;
use time::OffsetDateTime;

use crate::core::error::RagmillError;
use crate::core::time::{now_utc, to_rfc3339};
use crate::modules::db::DbLifecycleService;
use crate::modules::db_backend::db_connect;
use crate::modules::handlers::{HandlerChunk, HandlerResult};
use crate::modules::hashing::hash_text;
use crate::modules::persistence::{normalize_text, ChunkWriteOutcome, ChunkWritePipeline};

/// Aggregate of persistence counts for one staged file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStageOutcome {
    pub file_id: i64,
    pub symbols_written: usize,
    pub symbols_reused: usize,
    pub chunks_inserted: usize,
    pub chunks_reused: usize,
}

/// Staging operations bound to an open batch transaction.
pub struct StagingSession<'conn> {
    connection: &'conn Connection,
    now: OffsetDateTime,
}

impl<'conn> StagingSession<'conn> {
    pub fn new(connection: &'conn Connection) -> Self {
        Self {
            connection,
            now: now_utc(),
        }
    }

    pub fn connection(&self) -> &Connection {
        self.connection
    }

    /// Upsert the `batches` row for the current batch. Runs before any
    /// file is staged.
    pub fn ensure_batch(
        &self,
        batch_id: &str,
        batch_ref: Option<&str>,
        generated_at: OffsetDateTime,
        notes: Option<&str>,
    ) -> Result<(), RagmillError> {
        self.connection.execute(
            "INSERT INTO batches (id, ref, generated_at, notes)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 ref = excluded.ref,
                 generated_at = excluded.generated_at,
                 notes = excluded.notes",
            rusqlite::params![batch_id, batch_ref, to_rfc3339(generated_at), notes],
        )?;
        Ok(())
    }

    /// Stage one handler result: file row, symbols, then chunk slices.
    #[allow(clippy::too_many_arguments)]
    pub fn stage_file(
        &self,
        batch_id: &str,
        repo_path: &Path,
        language: &str,
        file_sha: &str,
        handler_name: &str,
        handler_version: &str,
        handler_versions: &FxHashMap<String, String>,
        result: &HandlerResult,
        absolute_path: Option<&Path>,
    ) -> Result<FileStageOutcome, RagmillError> {
        let normalized_path = repo_path.to_string_lossy().replace('\\', "/");

        let mut mtime_ns: Option<i64> = None;
        let mut size_bytes: Option<i64> = result
            .file
            .metadata
            .get("size_bytes")
            .and_then(Value::as_i64);
        if let Some(absolute) = absolute_path {
            if let Ok(stat) = std::fs::metadata(absolute) {
                if size_bytes.is_none() {
                    size_bytes = Some(stat.len() as i64);
                }
                mtime_ns = stat
                    .modified()
                    .ok()
                    .and_then(|value| value.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as i64);
            }
        }

        let file_id =
            self.upsert_file(batch_id, &normalized_path, language, file_sha, mtime_ns, size_bytes)?;

        let (symbol_ids, symbols_written, symbols_reused) =
            self.persist_symbols(batch_id, file_id, handler_name, handler_version, result)?;

        let mut effective_versions = handler_versions.clone();
        effective_versions
            .entry(handler_name.to_string())
            .or_insert_with(|| handler_version.to_string());

        let ChunkWriteOutcome { inserted, reused } = ChunkWritePipeline::persist_chunks(
            self.connection,
            batch_id,
            file_id,
            handler_name,
            handler_version,
            result,
            &effective_versions,
            &symbol_ids,
            self.now,
        )?;

        Ok(FileStageOutcome {
            file_id,
            symbols_written,
            symbols_reused,
            chunks_inserted: inserted,
            chunks_reused: reused,
        })
    }

    fn upsert_file(
        &self,
        batch_id: &str,
        repo_path: &str,
        lang: &str,
        file_sha: &str,
        mtime_ns: Option<i64>,
        size_bytes: Option<i64>,
    ) -> Result<i64, RagmillError> {
        let existing: Option<i64> = self
            .connection
            .query_row(
                "SELECT id FROM files WHERE repo_path = ?1",
                [repo_path],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.connection.execute(
                    "UPDATE files
                     SET batch_id = ?1, lang = ?2, file_sha = ?3,
                         mtime_ns = ?4, size_bytes = ?5
                     WHERE id = ?6",
                    rusqlite::params![batch_id, lang, file_sha, mtime_ns, size_bytes, id],
                )?;
                Ok(id)
            }
            None => {
                self.connection.execute(
                    "INSERT INTO files (batch_id, repo_path, lang, file_sha, mtime_ns, size_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![batch_id, repo_path, lang, file_sha, mtime_ns, size_bytes],
                )?;
                Ok(self.connection.last_insert_rowid())
            }
        }
    }

    fn persist_symbols(
        &self,
        batch_id: &str,
        file_id: i64,
        handler_name: &str,
        handler_version: &str,
        result: &HandlerResult,
    ) -> Result<(FxHashMap<String, i64>, usize, usize), RagmillError> {
        // Chunks grouped under their parent symbol, ordered by part.
        let mut grouped: FxHashMap<&str, Vec<&HandlerChunk>> = FxHashMap::default();
        for chunk in &result.chunks {
            if let Some(parent) = chunk.parent_symbol_id.as_deref() {
                grouped.entry(parent).or_default().push(chunk);
            }
        }
        for parts in grouped.values_mut() {
            parts.sort_by_key(|chunk| chunk.part_index);
        }

        let mut symbol_ids: FxHashMap<String, i64> = FxHashMap::default();
        let mut written = 0usize;
        let mut reused = 0usize;

        for symbol in &result.symbols {
            let symbol_path = if symbol.symbol_id.is_empty() {
                format!("{handler_name}:{}", symbol.name)
            } else {
                symbol.symbol_id.clone()
            };
            let chunks = grouped.get(symbol.symbol_id.as_str());

            let (start_line, end_line) = line_bounds(symbol, chunks);
            let text: String = chunks
                .map(|parts| parts.iter().map(|c| c.text.as_str()).collect())
                .unwrap_or_default();
            let normalized = normalize_text(&text);
            let tokens: i64 = chunks
                .map(|parts| {
                    parts
                        .iter()
                        .map(|c| c.token_count.unwrap_or(0) as i64)
                        .sum()
                })
                .unwrap_or(0);
            let symbol_sha = hash_text(&text, handler_version, &[&symbol_path]);
            let symbol_norm_sha = if normalized.is_empty() {
                None
            } else {
                Some(hash_text(&normalized, handler_version, &[&symbol_path]))
            };

            let existing = self
                .connection
                .query_row(
                    "SELECT id, kind, start_line, end_line, symbol_sha,
                            symbol_norm_sha, docstring, tokens, last_seen_batch
                     FROM symbols
                     WHERE file_id = ?1 AND symbol_path = ?2",
                    rusqlite::params![file_id, symbol_path],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, String>(8)?,
                        ))
                    },
                )
                .optional()?;

            match existing {
                None => {
                    self.connection.execute(
                        "INSERT INTO symbols (
                            file_id, kind, symbol_path, start_line, end_line,
                            symbol_sha, symbol_norm_sha, args_json, returns_json,
                            imports_json, deps_out_json, docstring, summary,
                            tokens, first_seen_batch, last_seen_batch
                        ) VALUES (
                            ?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, NULL,
                            ?8, NULL, ?9, ?10, ?10
                        )",
                        rusqlite::params![
                            file_id,
                            symbol.kind,
                            symbol_path,
                            start_line,
                            end_line,
                            symbol_sha,
                            symbol_norm_sha,
                            symbol.docstring,
                            tokens,
                            batch_id
                        ],
                    )?;
                    symbol_ids.insert(symbol.symbol_id.clone(), self.connection.last_insert_rowid());
                    written += 1;
                }
                Some((
                    id,
                    existing_kind,
                    existing_start,
                    existing_end,
                    existing_sha,
                    existing_norm,
                    existing_doc,
                    existing_tokens,
                    last_seen,
                )) => {
                    let equivalent = existing_kind == symbol.kind
                        && existing_start == start_line
                        && existing_end == end_line
                        && existing_sha == symbol_sha
                        && existing_norm == symbol_norm_sha
                        && existing_doc == symbol.docstring
                        && existing_tokens == tokens;
                    if equivalent {
                        if last_seen != batch_id {
                            self.connection.execute(
                                "UPDATE symbols SET last_seen_batch = ?1 WHERE id = ?2",
                                rusqlite::params![batch_id, id],
                            )?;
                        }
                        reused += 1;
                    } else {
                        self.connection.execute(
                            "UPDATE symbols
                             SET kind = ?1, start_line = ?2, end_line = ?3,
                                 symbol_sha = ?4, symbol_norm_sha = ?5,
                                 docstring = ?6, tokens = ?7, last_seen_batch = ?8
                             WHERE id = ?9",
                            rusqlite::params![
                                symbol.kind,
                                start_line,
                                end_line,
                                symbol_sha,
                                symbol_norm_sha,
                                symbol.docstring,
                                tokens,
                                batch_id,
                                id
                            ],
                        )?;
                        written += 1;
                    }
                    symbol_ids.insert(symbol.symbol_id.clone(), id);
                }
            }
        }

        Ok((symbol_ids, written, reused))
    }
}

fn line_bounds(
    symbol: &crate::modules::handlers::HandlerSymbol,
    chunks: Option<&Vec<&HandlerChunk>>,
) -> (i64, i64) {
    let mut start_line: Option<i64> = None;
    let mut end_line: Option<i64> = None;
    if let Some(parts) = chunks {
        for chunk in parts {
            if let Some(start) = chunk.metadata.get("start_line").and_then(Value::as_i64) {
                start_line = Some(start_line.map_or(start, |current: i64| current.min(start)));
            }
            if let Some(end) = chunk.metadata.get("end_line").and_then(Value::as_i64) {
                end_line = Some(end_line.map_or(end, |current: i64| current.max(end)));
            }
        }
    }
    let start_line = start_line
        .or_else(|| symbol.metadata.get("start_line").and_then(Value::as_i64))
        .unwrap_or(0);
    let end_line = end_line
        .or_else(|| symbol.metadata.get("end_line").and_then(Value::as_i64))
        .unwrap_or(start_line);
    (start_line, end_line)
}

/// Run `body` inside a batch staging transaction for `source`.
///
/// Ensures the database first (its own short-lived lock), then measures
/// the wait for the staging lock and opens one SQLite transaction for the
/// whole batch. Returns the body's output plus the lock wait in seconds.
pub fn parser_transaction<R>(
    db: &DbLifecycleService,
    source: &str,
    body: impl FnOnce(&StagingSession) -> Result<R, RagmillError>,
) -> Result<(R, f64), RagmillError> {
    let db_path = db.ensure(source)?;

    let started = Instant::now();
    let _lock = db.lock(source, "parser-stage")?;
    let lock_wait_seconds = started.elapsed().as_secs_f64();

    let connection = db_connect(&db_path)?;
    let tx = connection.unchecked_transaction()?;
    let session = StagingSession::new(&connection);
    let outcome = body(&session)?;
    tx.commit()?;
    Ok((outcome, lock_wait_seconds))
}
