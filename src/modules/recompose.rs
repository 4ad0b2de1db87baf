//! Reassemble persisted chunk slices into chunk trees.
//!
//! Slices group by `chunk_id`; parts concatenate in `part_index` order;
//! spans take the min of present starts and max of ends; the metadata of
//! part 0 carries over (minus `part_index`); delegate children attach to
//! their parents by `delegate_parent_chunk`. A dangling parent link is an
//! error.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::core::error::RagmillError;

/// Single persisted chunk slice prepared for recomposition.
#[derive(Debug, Clone)]
pub struct ChunkSlicePart {
    pub part_index: i64,
    pub part_total: i64,
    pub token_count: i64,
    pub text: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_byte: Option<i64>,
    pub end_byte: Option<i64>,
    pub overflow_is_truncated: bool,
    pub overflow_reason: Option<String>,
    pub metadata: Map<String, Value>,
    pub content_hash: String,
    pub content_norm_hash: Option<String>,
}

/// Chunk reconstructed from one or more slice parts.
#[derive(Debug, Clone)]
pub struct RecomposedChunk {
    pub chunk_id: String,
    pub batch_id: String,
    pub file_id: i64,
    pub handler_name: String,
    pub handler_version: String,
    pub symbol_id: Option<i64>,
    pub parent_symbol_id: Option<i64>,
    pub token_count: i64,
    pub metadata: Map<String, Value>,
    pub parts: Vec<ChunkSlicePart>,
    pub text: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_byte: Option<i64>,
    pub end_byte: Option<i64>,
    pub first_seen_batch: String,
    pub last_seen_batch: String,
    pub delegate_parent_chunk_id: Option<String>,
    pub delegate_children: Vec<RecomposedChunk>,
}

#[derive(Debug, Clone)]
struct SliceRecord {
    batch_id: String,
    file_id: i64,
    chunk_id: String,
    handler_name: String,
    handler_version: String,
    symbol_id: Option<i64>,
    parent_symbol_id: Option<i64>,
    first_seen_batch: String,
    last_seen_batch: String,
    part: ChunkSlicePart,
}

/// Load and recompose all chunks for `(batch_id, file_id)`.
///
/// Rows match on ownership or reuse: a slice first seen in an earlier
/// batch whose `last_seen_batch` reached this batch belongs to it.
pub fn recompose_for_file(
    connection: &Connection,
    batch_id: &str,
    file_id: i64,
) -> Result<Vec<RecomposedChunk>, RagmillError> {
    let mut stmt = connection.prepare(
        "SELECT batch_id, file_id, chunk_id, handler_name, handler_version,
                symbol_id, parent_symbol_id, part_index, part_total,
                token_count, content_text, start_line, end_line, start_byte,
                end_byte, overflow_is_truncated, overflow_reason,
                metadata_json, content_hash, content_norm_hash,
                first_seen_batch, last_seen_batch
         FROM chunk_slices
         WHERE file_id = ?1 AND (batch_id = ?2 OR last_seen_batch = ?2)",
    )?;
    let rows = stmt.query_map(rusqlite::params![file_id, batch_id], |row| {
        Ok(SliceRecord {
            batch_id: row.get(0)?,
            file_id: row.get(1)?,
            chunk_id: row.get(2)?,
            handler_name: row.get(3)?,
            handler_version: row.get(4)?,
            symbol_id: row.get(5)?,
            parent_symbol_id: row.get(6)?,
            first_seen_batch: row.get(20)?,
            last_seen_batch: row.get(21)?,
            part: ChunkSlicePart {
                part_index: row.get(7)?,
                part_total: row.get(8)?,
                token_count: row.get(9)?,
                text: row.get(10)?,
                start_line: row.get(11)?,
                end_line: row.get(12)?,
                start_byte: row.get(13)?,
                end_byte: row.get(14)?,
                overflow_is_truncated: row.get(15)?,
                overflow_reason: row.get(16)?,
                metadata: parse_metadata(row.get::<_, Option<String>>(17)?),
                content_hash: row.get(18)?,
                content_norm_hash: row.get(19)?,
            },
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    recompose_slices(records)
}

fn parse_metadata(raw: Option<String>) -> Map<String, Value> {
    raw.and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

fn recompose_slices(records: Vec<SliceRecord>) -> Result<Vec<RecomposedChunk>, RagmillError> {
    let mut grouped: BTreeMap<String, Vec<SliceRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.chunk_id.clone()).or_default().push(record);
    }
    if grouped.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunk_map: BTreeMap<String, RecomposedChunk> = BTreeMap::new();
    for (chunk_id, mut group) in grouped {
        group.sort_by_key(|record| record.part.part_index);
        let head = group[0].clone();
        let parts: Vec<ChunkSlicePart> = group.into_iter().map(|record| record.part).collect();

        let metadata = chunk_metadata(&parts);
        let delegate_parent_chunk_id = metadata
            .get("delegate_parent_chunk")
            .and_then(Value::as_str)
            .map(str::to_string);

        chunk_map.insert(
            chunk_id.clone(),
            RecomposedChunk {
                chunk_id,
                batch_id: head.batch_id,
                file_id: head.file_id,
                handler_name: head.handler_name,
                handler_version: head.handler_version,
                symbol_id: head.symbol_id,
                parent_symbol_id: head.parent_symbol_id,
                token_count: parts.iter().map(|part| part.token_count).sum(),
                text: parts.iter().map(|part| part.text.as_str()).collect(),
                start_line: parts.iter().filter_map(|part| part.start_line).min(),
                end_line: parts.iter().filter_map(|part| part.end_line).max(),
                start_byte: parts.iter().filter_map(|part| part.start_byte).min(),
                end_byte: parts.iter().filter_map(|part| part.end_byte).max(),
                first_seen_batch: head.first_seen_batch,
                last_seen_batch: head.last_seen_batch,
                metadata,
                parts,
                delegate_parent_chunk_id,
                delegate_children: Vec::new(),
            },
        );
    }

    // Attach delegate children to their parents; dangling links raise.
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for chunk in chunk_map.values() {
        if let Some(parent_id) = &chunk.delegate_parent_chunk_id {
            if !chunk_map.contains_key(parent_id) {
                return Err(RagmillError::ParserError(format!(
                    "Delegate chunk {:?} references missing parent {:?}",
                    chunk.chunk_id, parent_id
                )));
            }
            children
                .entry(parent_id.clone())
                .or_default()
                .push(chunk.chunk_id.clone());
        }
    }

    for (parent_id, child_ids) in children {
        let mut attached: Vec<RecomposedChunk> = child_ids
            .iter()
            .map(|child_id| chunk_map.get(child_id).cloned().expect("child exists"))
            .collect();
        attached.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        if let Some(parent) = chunk_map.get_mut(&parent_id) {
            parent.delegate_children = attached;
        }
    }

    let mut roots: Vec<RecomposedChunk> = chunk_map
        .into_values()
        .filter(|chunk| chunk.delegate_parent_chunk_id.is_none())
        .collect();
    roots.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    Ok(roots)
}

fn chunk_metadata(parts: &[ChunkSlicePart]) -> Map<String, Value> {
    let Some(first) = parts.first() else {
        return Map::new();
    };
    let mut base = first.metadata.clone();
    base.remove("part_index");

    let mut totals: Vec<i64> = parts
        .iter()
        .map(|part| part.part_total)
        .filter(|total| *total > 0)
        .collect();
    totals.sort();
    totals.dedup();
    let mut aggregate = parts.len() as i64;
    if totals.len() == 1 {
        aggregate = aggregate.max(totals[0]);
    }
    base.insert("part_total".to_string(), Value::Number(aggregate.into()));
    base
}

fn sort_key(chunk: &RecomposedChunk) -> (i64, i64, String) {
    let position = chunk
        .start_byte
        .or(chunk.start_line)
        .or_else(|| chunk.parts.first().map(|part| part.part_index))
        .unwrap_or(0);
    (chunk.file_id, position, chunk.chunk_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(index: i64, total: i64, text: &str) -> ChunkSlicePart {
        ChunkSlicePart {
            part_index: index,
            part_total: total,
            token_count: 1,
            text: text.to_string(),
            start_line: Some(index + 1),
            end_line: Some(index + 1),
            start_byte: Some(index * 10),
            end_byte: Some(index * 10 + text.len() as i64),
            overflow_is_truncated: total > 1,
            overflow_reason: None,
            metadata: Map::new(),
            content_hash: format!("hash-{index}"),
            content_norm_hash: None,
        }
    }

    fn record(chunk_id: &str, p: ChunkSlicePart) -> SliceRecord {
        SliceRecord {
            batch_id: "b1".to_string(),
            file_id: 1,
            chunk_id: chunk_id.to_string(),
            handler_name: "text".to_string(),
            handler_version: "1.0.0".to_string(),
            symbol_id: None,
            parent_symbol_id: None,
            first_seen_batch: "b1".to_string(),
            last_seen_batch: "b1".to_string(),
            part: p,
        }
    }

    #[test]
    fn test_parts_concatenate_in_order() {
        let records = vec![
            record("c1", part(1, 2, "world")),
            record("c1", part(0, 2, "hello ")),
        ];
        let chunks = recompose_slices(records).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].token_count, 2);
        assert_eq!(chunks[0].metadata["part_total"], 2);
        assert_eq!(chunks[0].start_byte, Some(0));
    }

    #[test]
    fn test_dangling_delegate_parent_raises() {
        let mut orphan = part(0, 1, "body");
        orphan.metadata.insert(
            "delegate_parent_chunk".to_string(),
            Value::String("missing".to_string()),
        );
        let records = vec![record("child", orphan)];
        assert!(recompose_slices(records).is_err());
    }

    #[test]
    fn test_delegate_children_attach_to_parent() {
        let mut child = part(0, 1, "console.log(1)");
        child.metadata.insert(
            "delegate_parent_chunk".to_string(),
            Value::String("shell".to_string()),
        );
        let records = vec![
            record("shell", part(0, 1, "<html>")),
            record("child", child),
        ];
        let chunks = recompose_slices(records).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "shell");
        assert_eq!(chunks[0].delegate_children.len(), 1);
        assert_eq!(chunks[0].delegate_children[0].chunk_id, "child");
    }
}
