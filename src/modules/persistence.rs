//! Chunk slice persistence with batch-aware reuse.
//!
//! Slices are keyed by `(batch_id, chunk_id, part_index)`. When an identity
//! re-appears in a later batch with an unchanged content signature, the
//! original row keeps its `first_seen_batch` and only `last_seen_batch`
//! advances; nothing is inserted for the new batch. Changed or new
//! identities insert rows owned by the current batch.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::core::error::RagmillError;
use crate::core::time::to_rfc3339;
use crate::modules::handlers::HandlerResult;
use crate::modules::hashing::hash_text;
use rustc_hash::FxHashMap;

/// Row payload prepared for insertion into `chunk_slices`.
#[derive(Debug, Clone)]
pub struct ChunkSliceRow {
    pub batch_id: String,
    pub file_id: i64,
    pub symbol_id: Option<i64>,
    pub parent_symbol_id: Option<i64>,
    pub chunk_id: String,
    pub handler_name: String,
    pub handler_version: String,
    pub part_index: i64,
    pub part_total: i64,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_byte: Option<i64>,
    pub end_byte: Option<i64>,
    pub token_count: i64,
    pub content_hash: String,
    pub content_norm_hash: Option<String>,
    pub content_text: String,
    pub overflow_is_truncated: bool,
    pub overflow_reason: Option<String>,
    pub metadata_json: Option<String>,
}

/// Counts returned after persisting one handler result's chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkWriteOutcome {
    pub inserted: usize,
    pub reused: usize,
}

/// CRLF/CR to LF plus a surrounding-whitespace strip; shared by every
/// handler through this pipeline (no handler-specific extensions).
pub fn normalize_text(value: &str) -> String {
    value
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

fn metadata_json(metadata: &Map<String, Value>) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }
    // serde_json maps are BTree-backed: compact output is key-sorted.
    serde_json::to_string(&Value::Object(metadata.clone())).ok()
}

fn read_int(metadata: &Map<String, Value>, key: &str) -> Option<i64> {
    metadata.get(key).and_then(Value::as_i64)
}

/// Transform handler output into persisted `chunk_slices` rows.
pub struct ChunkWritePipeline;

impl ChunkWritePipeline {
    /// Persist `result`'s chunks for `file_id` within `batch_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_chunks(
        connection: &Connection,
        batch_id: &str,
        file_id: i64,
        handler_name: &str,
        handler_version: &str,
        result: &HandlerResult,
        handler_versions: &FxHashMap<String, String>,
        symbol_ids: &FxHashMap<String, i64>,
        now: OffsetDateTime,
    ) -> Result<ChunkWriteOutcome, RagmillError> {
        let mut outcome = ChunkWriteOutcome::default();
        if result.chunks.is_empty() {
            return Ok(outcome);
        }

        for chunk in &result.chunks {
            let effective_handler = chunk.delegate.as_deref().unwrap_or(handler_name);
            let effective_version = match handler_versions.get(effective_handler) {
                Some(version) => version.clone(),
                None if effective_handler == handler_name => handler_version.to_string(),
                None => {
                    return Err(RagmillError::ParserError(format!(
                        "Missing handler version for delegate {effective_handler:?}"
                    )))
                }
            };

            let token_count = chunk.token_count.ok_or_else(|| {
                RagmillError::ParserError(format!(
                    "Chunk {:?} emitted without token count",
                    chunk.chunk_id
                ))
            })? as i64;

            let symbol_id = lookup_symbol(chunk.parent_symbol_id.as_deref(), symbol_ids)?;
            let delegate_parent = chunk
                .metadata
                .get("delegate_parent_symbol")
                .and_then(Value::as_str);
            let parent_symbol_id = lookup_symbol(delegate_parent, symbol_ids)?;

            let overflow_flag = chunk
                .metadata
                .get("overflow")
                .and_then(Value::as_bool)
                .or_else(|| {
                    chunk
                        .metadata
                        .get("overflow_is_truncated")
                        .and_then(Value::as_bool)
                })
                .unwrap_or(false);
            let overflow_reason = chunk
                .metadata
                .get("overflow_reason")
                .and_then(Value::as_str)
                .map(str::to_string);

            let normalized = normalize_text(&chunk.text);
            let content_hash = hash_text(
                &chunk.text,
                &effective_version,
                &[&chunk.chunk_id, effective_handler],
            );
            let content_norm_hash = hash_text(
                &normalized,
                &effective_version,
                &[&chunk.chunk_id, effective_handler],
            );

            let row = ChunkSliceRow {
                batch_id: batch_id.to_string(),
                file_id,
                symbol_id,
                parent_symbol_id,
                chunk_id: chunk.chunk_id.clone(),
                handler_name: effective_handler.to_string(),
                handler_version: effective_version,
                part_index: chunk.part_index as i64,
                part_total: read_int(&chunk.metadata, "part_total").unwrap_or(1),
                start_line: read_int(&chunk.metadata, "start_line"),
                end_line: read_int(&chunk.metadata, "end_line"),
                start_byte: Some(chunk.start_offset as i64),
                end_byte: Some(chunk.end_offset as i64),
                token_count,
                content_hash,
                content_norm_hash: Some(content_norm_hash),
                content_text: chunk.text.clone(),
                overflow_is_truncated: overflow_flag,
                overflow_reason,
                metadata_json: metadata_json(&chunk.metadata),
            };

            if Self::try_reuse(connection, &row, batch_id, now)? {
                outcome.reused += 1;
            } else {
                Self::upsert(connection, &row, now)?;
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    /// Advance `last_seen_batch` on a prior batch's row when the identity
    /// re-appears byte-for-byte. Returns whether a reuse happened.
    fn try_reuse(
        connection: &Connection,
        row: &ChunkSliceRow,
        batch_id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, RagmillError> {
        let existing = connection
            .query_row(
                "SELECT batch_id, content_hash, content_norm_hash, token_count,
                        metadata_json, overflow_is_truncated, overflow_reason,
                        start_line, end_line, start_byte, end_byte
                 FROM chunk_slices
                 WHERE file_id = ?1 AND chunk_id = ?2 AND part_index = ?3
                 ORDER BY last_seen_batch DESC
                 LIMIT 1",
                rusqlite::params![row.file_id, row.chunk_id, row.part_index],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, bool>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, Option<i64>>(7)?,
                        r.get::<_, Option<i64>>(8)?,
                        r.get::<_, Option<i64>>(9)?,
                        r.get::<_, Option<i64>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            existing_batch,
            content_hash,
            content_norm_hash,
            token_count,
            existing_metadata,
            overflow_flag,
            overflow_reason,
            start_line,
            end_line,
            start_byte,
            end_byte,
        )) = existing
        else {
            return Ok(false);
        };

        let unchanged = existing_batch != batch_id
            && content_hash == row.content_hash
            && content_norm_hash == row.content_norm_hash
            && token_count == row.token_count
            && existing_metadata == row.metadata_json
            && overflow_flag == row.overflow_is_truncated
            && overflow_reason == row.overflow_reason
            && start_line == row.start_line
            && end_line == row.end_line
            && start_byte == row.start_byte
            && end_byte == row.end_byte;
        if !unchanged {
            return Ok(false);
        }

        connection.execute(
            "UPDATE chunk_slices
             SET last_seen_batch = ?1, updated_at = ?2
             WHERE batch_id = ?3 AND chunk_id = ?4 AND part_index = ?5",
            rusqlite::params![
                batch_id,
                to_rfc3339(now),
                existing_batch,
                row.chunk_id,
                row.part_index
            ],
        )?;
        Ok(true)
    }

    /// Idempotent insert for the current batch: re-running the same batch
    /// updates the mutable columns in place.
    fn upsert(
        connection: &Connection,
        row: &ChunkSliceRow,
        now: OffsetDateTime,
    ) -> Result<(), RagmillError> {
        let timestamp = to_rfc3339(now);
        connection.execute(
            "INSERT INTO chunk_slices (
                batch_id, file_id, symbol_id, parent_symbol_id, chunk_id,
                handler_name, handler_version, part_index, part_total,
                start_line, end_line, start_byte, end_byte, token_count,
                content_hash, content_norm_hash, content_text,
                overflow_is_truncated, overflow_reason, metadata_json,
                created_at, updated_at, first_seen_batch, last_seen_batch
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?21, ?1, ?1
            )
            ON CONFLICT(batch_id, chunk_id, part_index) DO UPDATE SET
                file_id = excluded.file_id,
                symbol_id = excluded.symbol_id,
                parent_symbol_id = excluded.parent_symbol_id,
                handler_name = excluded.handler_name,
                handler_version = excluded.handler_version,
                part_total = excluded.part_total,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                start_byte = excluded.start_byte,
                end_byte = excluded.end_byte,
                token_count = excluded.token_count,
                content_hash = excluded.content_hash,
                content_norm_hash = excluded.content_norm_hash,
                content_text = excluded.content_text,
                overflow_is_truncated = excluded.overflow_is_truncated,
                overflow_reason = excluded.overflow_reason,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at,
                last_seen_batch = excluded.last_seen_batch",
            rusqlite::params![
                row.batch_id,
                row.file_id,
                row.symbol_id,
                row.parent_symbol_id,
                row.chunk_id,
                row.handler_name,
                row.handler_version,
                row.part_index,
                row.part_total,
                row.start_line,
                row.end_line,
                row.start_byte,
                row.end_byte,
                row.token_count,
                row.content_hash,
                row.content_norm_hash,
                row.content_text,
                row.overflow_is_truncated,
                row.overflow_reason,
                row.metadata_json,
                timestamp,
            ],
        )?;
        Ok(())
    }
}

fn lookup_symbol(
    key: Option<&str>,
    symbol_ids: &FxHashMap<String, i64>,
) -> Result<Option<i64>, RagmillError> {
    match key {
        None => Ok(None),
        Some(key) if key.is_empty() => Ok(None),
        Some(key) => symbol_ids.get(key).copied().map(Some).ok_or_else(|| {
            RagmillError::ParserError(format!("Symbol mapping missing for key {key:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_unifies_newlines() {
        assert_eq!(normalize_text("a\r\nb\r"), "a\nb");
        assert_eq!(normalize_text("\n\n body \n\n"), "body");
    }

    #[test]
    fn test_lookup_symbol_missing_key_is_contract_violation() {
        let ids = FxHashMap::default();
        assert!(lookup_symbol(Some("python:missing"), &ids).is_err());
        assert!(lookup_symbol(None, &ids).unwrap().is_none());
    }
}
