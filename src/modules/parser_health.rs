//! Health evaluation for parser state: batch integrity, slice part
//! contiguity, delegate linkage, and lock-contention thresholds.

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::config::{ParserSettings, WorkspaceHandle, PARSER_MODULE_KEY};
use crate::core::health::{HealthReport, HealthStatus};
use crate::modules::manifest::ManifestService;
use crate::modules::parser::{ParserManifestState, ParserRunMetrics};

struct SliceProbe {
    chunk_id: String,
    part_index: i64,
    part_total: i64,
    metadata_json: Option<String>,
}

/// Return health reports for each configured parser source.
pub fn parser_health_hook(handle: &WorkspaceHandle) -> Vec<HealthReport> {
    if !handle.config.parser.enabled {
        return vec![HealthReport::new("parser-module", HealthStatus::Unknown)
            .with_summary("Parser module disabled via configuration.")
            .with_actions(vec![
                "Set `modules.parser.enabled = true` in ragmill.toml to enable checks."
                    .to_string(),
            ])];
    }

    let manifest_service =
        ManifestService::new(handle.paths.clone(), handle.config.manifest.clone());

    handle
        .config
        .iter_sources()
        .map(|(name, _)| evaluate_source(name, handle, &manifest_service, &handle.config.parser))
        .collect()
}

fn evaluate_source(
    name: &str,
    handle: &WorkspaceHandle,
    manifest_service: &ManifestService,
    settings: &ParserSettings,
) -> HealthReport {
    let parse_action = format!("Run `ragmill parser parse {name}` to rebuild parser data.");

    let snapshot = match manifest_service.load(name, false, false) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return HealthReport::new(name, HealthStatus::Error)
                .with_summary(format!("Failed to read manifest: {err}"))
                .with_actions(vec![parse_action]);
        }
    };
    let payload = snapshot.module(PARSER_MODULE_KEY);
    let entry_missing = payload.is_none();
    let state = ParserManifestState::from_value(payload);

    let mut status = state.last_run_status;
    let mut issues: Vec<String> = Vec::new();
    let mut actions: Vec<String> = state.last_run_notes.clone();

    if entry_missing {
        issues.push("parser manifest entry missing".to_string());
        status = status.elevate(HealthStatus::Unknown);
    }

    let last_refresh = state
        .last_run_completed_at
        .as_deref()
        .and_then(|text| crate::core::time::parse_rfc3339(text).ok());

    let Some(batch_id) = state.last_batch_id.clone() else {
        issues.push("parser has not completed a batch yet".to_string());
        if !actions.contains(&parse_action) {
            actions.push(parse_action);
        }
        actions.sort();
        return HealthReport::new(name, status.elevate(HealthStatus::Unknown))
            .with_summary(issues.join(", "))
            .with_actions(actions)
            .with_last_refresh(last_refresh);
    };

    let db_path = handle.paths.source_database_path(name);
    if !db_path.exists() {
        return HealthReport::new(name, HealthStatus::Error)
            .with_summary("Parser database missing while manifest references a batch.")
            .with_actions(vec![parse_action])
            .with_last_refresh(last_refresh);
    }
    let connection = match Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
    {
        Ok(connection) => connection,
        Err(err) => {
            return HealthReport::new(name, HealthStatus::Error)
                .with_summary(format!(
                    "Failed to open parser database {}: {err}",
                    db_path.display()
                ))
                .with_actions(vec![parse_action])
                .with_last_refresh(last_refresh);
        }
    };

    match observe_batch(&connection, &batch_id) {
        Err(summary) => {
            return HealthReport::new(name, HealthStatus::Error)
                .with_summary(summary)
                .with_actions(vec![parse_action])
                .with_last_refresh(last_refresh);
        }
        Ok(slices) => {
            let (chunk_issues, severity) = assess_chunk_integrity(&slices);
            if let Some(severity) = severity {
                status = status.elevate(severity);
            }
            if !chunk_issues.is_empty() && !actions.contains(&parse_action) {
                actions.push(parse_action.clone());
            }
            issues.extend(chunk_issues);
        }
    }

    let (metric_issues, metric_actions, severity) =
        assess_concurrency_metrics(&state.metrics, settings);
    if let Some(severity) = severity {
        status = status.elevate(severity);
    }
    issues.extend(metric_issues);
    for action in metric_actions {
        if !actions.contains(&action) {
            actions.push(action);
        }
    }

    let summary = if issues.is_empty() {
        state.last_run_summary.clone()
    } else {
        Some(issues.join(", "))
    };
    actions.sort();
    actions.dedup();

    let mut report = HealthReport::new(name, status)
        .with_actions(actions)
        .with_last_refresh(last_refresh);
    report.summary = summary;
    report
}

fn observe_batch(connection: &Connection, batch_id: &str) -> Result<Vec<SliceProbe>, String> {
    let has_batch: Option<i64> = connection
        .query_row(
            "SELECT 1 FROM batches WHERE id = ?1",
            [batch_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| format!("Failed querying batches: {err}"))?;
    if has_batch.is_none() {
        return Err("Manifest last_batch_id missing from batches table.".to_string());
    }

    let mut stmt = connection
        .prepare(
            "SELECT chunk_id, part_index, part_total, metadata_json
             FROM chunk_slices
             WHERE batch_id = ?1 OR last_seen_batch = ?1",
        )
        .map_err(|err| format!("Failed querying chunk slices: {err}"))?;
    let rows = stmt
        .query_map([batch_id], |row| {
            Ok(SliceProbe {
                chunk_id: row.get(0)?,
                part_index: row.get(1)?,
                part_total: row.get(2)?,
                metadata_json: row.get(3)?,
            })
        })
        .map_err(|err| format!("Failed querying chunk slices: {err}"))?;

    let mut slices = Vec::new();
    for row in rows {
        slices.push(row.map_err(|err| format!("Failed reading chunk slices: {err}"))?);
    }
    if slices.is_empty() {
        return Err("No chunk slices recorded for the last batch.".to_string());
    }
    Ok(slices)
}

/// Part contiguity and delegate linkage checks over one batch's slices.
fn assess_chunk_integrity(slices: &[SliceProbe]) -> (Vec<String>, Option<HealthStatus>) {
    let mut issues = Vec::new();
    let mut severity: Option<HealthStatus> = None;

    let mut by_chunk: BTreeMap<&str, Vec<&SliceProbe>> = BTreeMap::new();
    for slice in slices {
        by_chunk.entry(&slice.chunk_id).or_default().push(slice);
    }

    for (chunk_id, parts) in &by_chunk {
        let declared_total = parts.iter().map(|part| part.part_total).max().unwrap_or(1);
        let mut indexes: Vec<i64> = parts.iter().map(|part| part.part_index).collect();
        indexes.sort();
        indexes.dedup();
        let expected: Vec<i64> = (0..declared_total.max(indexes.len() as i64)).collect();
        if indexes != expected {
            issues.push(format!("chunk {chunk_id} has non-contiguous parts"));
            severity = Some(
                severity
                    .unwrap_or(HealthStatus::Ok)
                    .elevate(HealthStatus::Error),
            );
        }
    }

    for slice in slices {
        let Some(raw) = &slice.metadata_json else {
            continue;
        };
        let Ok(metadata) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        let Some(parent) = metadata.get("delegate_parent_chunk").and_then(Value::as_str) else {
            continue;
        };
        if !by_chunk.contains_key(parent) {
            issues.push(format!(
                "chunk {} references missing delegate parent {parent}",
                slice.chunk_id
            ));
            severity = Some(
                severity
                    .unwrap_or(HealthStatus::Ok)
                    .elevate(HealthStatus::Error),
            );
        }
    }

    (issues, severity)
}

/// Lock-wait and contention counters against the configured thresholds.
fn assess_concurrency_metrics(
    metrics: &ParserRunMetrics,
    settings: &ParserSettings,
) -> (Vec<String>, Vec<String>, Option<HealthStatus>) {
    let mut issues = Vec::new();
    let mut actions = Vec::new();
    let mut severity: Option<HealthStatus> = None;
    let runbook =
        "Reduce `modules.parser.max_concurrency` or stagger parse runs; thresholds are tunable \
         via `modules.parser.lock_wait_*` in ragmill.toml."
            .to_string();

    let mut elevate = |candidate: HealthStatus, severity: &mut Option<HealthStatus>| {
        *severity = Some(severity.unwrap_or(HealthStatus::Ok).elevate(candidate));
    };

    if metrics.lock_wait_seconds >= settings.lock_wait_error_seconds {
        issues.push(format!(
            "database lock wait {:.2}s exceeded error threshold",
            metrics.lock_wait_seconds
        ));
        elevate(HealthStatus::Error, &mut severity);
        actions.push(runbook.clone());
    } else if metrics.lock_wait_seconds >= settings.lock_wait_warning_seconds {
        issues.push(format!(
            "database lock wait {:.2}s exceeded warning threshold",
            metrics.lock_wait_seconds
        ));
        elevate(HealthStatus::Degraded, &mut severity);
        actions.push(runbook.clone());
    }

    if metrics.lock_contention_events >= settings.lock_contention_error {
        issues.push(format!(
            "lock contention events ({}) exceeded error threshold",
            metrics.lock_contention_events
        ));
        elevate(HealthStatus::Error, &mut severity);
        actions.push(runbook);
    } else if metrics.lock_contention_events >= settings.lock_contention_warning {
        issues.push(format!(
            "lock contention events ({}) exceeded warning threshold",
            metrics.lock_contention_events
        ));
        elevate(HealthStatus::Degraded, &mut severity);
        actions.push(runbook);
    }

    (issues, actions, severity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(chunk_id: &str, part_index: i64, part_total: i64) -> SliceProbe {
        SliceProbe {
            chunk_id: chunk_id.to_string(),
            part_index,
            part_total,
            metadata_json: None,
        }
    }

    #[test]
    fn test_contiguous_parts_pass() {
        let slices = vec![probe("c1", 0, 2), probe("c1", 1, 2), probe("c2", 0, 1)];
        let (issues, severity) = assess_chunk_integrity(&slices);
        assert!(issues.is_empty());
        assert!(severity.is_none());
    }

    #[test]
    fn test_gap_in_parts_is_error() {
        let slices = vec![probe("c1", 0, 3), probe("c1", 2, 3)];
        let (issues, severity) = assess_chunk_integrity(&slices);
        assert_eq!(issues.len(), 1);
        assert_eq!(severity, Some(HealthStatus::Error));
    }

    #[test]
    fn test_lock_thresholds_promote_severity() {
        let mut metrics = ParserRunMetrics::default();
        metrics.lock_wait_seconds = 6.0;
        let settings = ParserSettings::default();
        let (issues, actions, severity) = assess_concurrency_metrics(&metrics, &settings);
        assert_eq!(issues.len(), 1);
        assert!(!actions.is_empty());
        assert_eq!(severity, Some(HealthStatus::Degraded));
    }
}
