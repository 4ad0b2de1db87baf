use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use ragmill::core::config::AppConfig;
use ragmill::core::error::RagmillError;
use ragmill::core::lock::{build_lock_path, FileLock};
use ragmill::core::paths::resolve_workspace;
use ragmill::core::source::{ensure_workspace_path, normalize_source_slug};
use ragmill::core::uuid7::{
    ensure_short_uuid7_order, generate_uuid7, short_uuid7, uuid7_timestamp, validate_short_uuid7,
};
use tempfile::tempdir;
use time::OffsetDateTime;

#[test]
fn workspace_resolution_precedence_and_layout() {
    let tmp = tempdir().expect("tempdir");
    let explicit = tmp.path().join("explicit");
    let from_env = tmp.path().join("env");

    let paths = resolve_workspace(Some(&explicit), Some(&from_env)).expect("resolve");
    assert_eq!(paths.workspace, explicit);

    let paths = resolve_workspace(None, Some(&from_env)).expect("resolve env");
    assert_eq!(paths.workspace, from_env);

    paths.ensure_layout().expect("layout");
    assert!(paths.sources_dir.is_dir());
    assert!(paths.logs_dir.is_dir());
    assert!(paths.archives_dir.is_dir());
    assert!(paths.locks_dir().is_dir());
}

#[test]
fn workspace_rejects_regular_file() {
    let tmp = tempdir().expect("tempdir");
    let file_path = tmp.path().join("not-a-dir");
    std::fs::write(&file_path, b"occupied").expect("write");
    match resolve_workspace(Some(&file_path), None) {
        Err(RagmillError::PathError(_)) => {}
        other => panic!("expected path error, got {other:?}"),
    }
}

#[test]
fn slug_normalization_is_idempotent_and_shaped() {
    let pattern = regex::Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
    for raw in [
        "My Demo Project!",
        "  spaced   out  ",
        "Café-Docs",
        "UPPER_case.mixed",
        "a",
        "42",
    ] {
        let slug = normalize_source_slug(raw).expect("slug");
        assert!(pattern.is_match(&slug), "slug {slug:?} shape");
        assert_eq!(normalize_source_slug(&slug).expect("idempotent"), slug);
    }
    assert!(normalize_source_slug("!!!").is_err());
    assert!(normalize_source_slug("").is_err());
}

#[test]
fn path_validation_bounds_candidates() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();
    let inside = base.join("sources").join("demo");
    assert!(ensure_workspace_path(base, &inside).is_ok());

    let escape = base.join("..").join("escape");
    assert!(ensure_workspace_path(base, &escape).is_err());
}

#[test]
fn uuid7_timestamp_round_trip_and_ordering() {
    let base = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();
    let mut values = Vec::new();
    for step in 0..64i64 {
        let when = base + time::Duration::milliseconds(step * 37);
        let value = generate_uuid7(when).expect("uuid7");
        assert_eq!(uuid7_timestamp(&value).expect("timestamp"), when);
        values.push(value);
    }
    assert!(ensure_short_uuid7_order(&values));

    let shorts: Vec<String> = values.iter().map(short_uuid7).collect();
    let mut sorted = shorts.clone();
    sorted.sort();
    assert_eq!(shorts, sorted, "short forms sort like their UUIDs");
    for short in &shorts {
        validate_short_uuid7(short).expect("valid short");
    }
}

#[test]
fn file_lock_serializes_across_threads() {
    let tmp = tempdir().expect("tempdir");
    let lock_path = build_lock_path(&tmp.path().join("manifest.json"), ".lock");

    let mut first = FileLock::new(
        lock_path.clone(),
        Duration::from_secs(2),
        Duration::from_millis(5),
    );
    first.acquire().expect("first acquire");

    let barrier = Arc::new(Barrier::new(2));
    let thread_barrier = barrier.clone();
    let thread_path = lock_path.clone();
    let waiter = std::thread::spawn(move || {
        let mut second = FileLock::new(
            thread_path,
            Duration::from_secs(2),
            Duration::from_millis(5),
        );
        thread_barrier.wait();
        let started = Instant::now();
        second.acquire().expect("second acquire");
        let waited = started.elapsed();
        second.release();
        waited
    });

    barrier.wait();
    std::thread::sleep(Duration::from_millis(100));
    first.release();

    let waited = waiter.join().expect("join");
    assert!(waited >= Duration::from_millis(50), "waiter blocked on lock");
    assert!(!lock_path.exists(), "lockfile removed after release");
}

#[test]
fn lock_release_is_safe_when_never_acquired() {
    let tmp = tempdir().expect("tempdir");
    let mut lock = FileLock::new(
        tmp.path().join("never.lock"),
        Duration::from_millis(10),
        Duration::from_millis(2),
    );
    lock.release();
    assert!(!lock.is_held());
}

#[test]
fn config_round_trip_preserves_unknown_tables() {
    let text = r#"
[workspace]
root = "/tmp/ws"

[workspace.sources.demo]
path = "/tmp/demo"

[experimental]
flag = true

[db]
vacuum_max_stale_days = 3
"#;
    let config = AppConfig::from_toml_str(text).expect("parse");
    assert_eq!(config.db.vacuum_max_stale_days, 3);
    assert!(config.source("demo").is_some());

    let rendered = config.to_toml_string().expect("render");
    assert!(rendered.contains("[experimental]"));
    assert!(rendered.contains("flag = true"));

    let reparsed = AppConfig::from_toml_str(&rendered).expect("reparse");
    assert_eq!(reparsed.db.vacuum_max_stale_days, 3);
}

#[test]
fn config_rejects_malformed_source_entry() {
    let text = r#"
[workspace.sources.demo]
enabled = true
"#;
    match AppConfig::from_toml_str(text) {
        Err(RagmillError::ConfigError(message)) => {
            assert!(message.contains("path"));
        }
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn lock_path_helper_appends_suffix() {
    let path = build_lock_path(Path::new("/ws/sources/a/manifest.json"), ".lock");
    assert_eq!(
        path.file_name().unwrap().to_string_lossy(),
        "manifest.json.lock"
    );
}
