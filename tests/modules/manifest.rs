use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ragmill::core::config::ManifestSettings;
use ragmill::core::error::RagmillError;
use ragmill::core::paths::resolve_workspace;
use ragmill::core::paths::WorkspacePaths;
use ragmill::modules::manifest::{compute_checksum, create_backup, ManifestService};
use ragmill::modules::manifest_migrator::{ManifestMigrator, MODULES_VERSION};
use serde_json::json;
use tempfile::tempdir;

fn workspace(tmp: &tempfile::TempDir) -> WorkspacePaths {
    let paths = resolve_workspace(Some(&tmp.path().join("ws")), None).expect("resolve");
    paths.ensure_layout().expect("layout");
    paths
}

fn service(paths: &WorkspacePaths) -> ManifestService {
    ManifestService::new(paths.clone(), ManifestSettings::default())
}

#[test]
fn missing_manifest_loads_as_empty_document() {
    let tmp = tempdir().expect("tempdir");
    let service = service(&workspace(&tmp));
    let snapshot = service.load("alpha", false, false).expect("load");
    assert_eq!(snapshot.data, json!({}));
}

#[test]
fn malformed_manifest_is_a_read_error() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let manifest_path = paths.source_manifest_path("alpha");
    std::fs::create_dir_all(manifest_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&manifest_path, b"{not json").expect("write");

    match service(&paths).load("alpha", false, false) {
        Err(RagmillError::ManifestRead(_)) => {}
        other => panic!("expected read error, got {other:?}"),
    }

    std::fs::write(&manifest_path, b"[1, 2, 3]").expect("write");
    match service(&paths).load("alpha", false, false) {
        Err(RagmillError::ManifestRead(message)) => {
            assert!(message.contains("not a JSON object"));
        }
        other => panic!("expected read error, got {other:?}"),
    }
}

#[test]
fn write_persists_sorted_pretty_json_atomically() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let service = service(&paths);

    let snapshot = service
        .write("alpha", |snapshot| {
            let modules = snapshot.ensure_modules();
            modules.insert("custom".to_string(), json!({"zeta": 1, "alpha": 2}));
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })
        .expect("write");

    let manifest_path = paths.source_manifest_path("alpha");
    let on_disk = std::fs::read_to_string(&manifest_path).expect("read");
    let parsed: serde_json::Value = serde_json::from_str(&on_disk).expect("parse");
    assert_eq!(parsed, snapshot.data);
    assert_eq!(
        on_disk,
        serde_json::to_string_pretty(&snapshot.data).unwrap(),
        "file bytes match the snapshot serialization"
    );
    // serde_json maps are BTree-backed, so keys serialize sorted.
    let alpha_at = on_disk.find("\"alpha\"").unwrap();
    let zeta_at = on_disk.find("\"zeta\"").unwrap();
    assert!(alpha_at < zeta_at);

    // No staging temp files left behind.
    let leftovers: Vec<_> = std::fs::read_dir(manifest_path.parent().unwrap())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn unchanged_write_does_not_touch_the_file() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let service = service(&paths);

    service
        .write("alpha", |snapshot| {
            snapshot.ensure_modules();
            Ok(())
        })
        .expect("first write");
    let manifest_path = paths.source_manifest_path("alpha");
    let before = std::fs::read_to_string(&manifest_path).expect("read");

    service.write("alpha", |_| Ok(())).expect("noop write");
    let after = std::fs::read_to_string(&manifest_path).expect("read");
    assert_eq!(before, after);
}

#[test]
fn legacy_manifest_migrates_under_load() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let manifest_path = paths.source_manifest_path("legacy");
    std::fs::create_dir_all(manifest_path.parent().unwrap()).expect("mkdir");
    let legacy = json!({
        "name": "legacy",
        "path": "/abs",
        "enabled": true,
        "target": null,
        "last_refresh_at": null,
        "last_health": {"status": "unknown"},
    });
    std::fs::write(&manifest_path, serde_json::to_string(&legacy).unwrap()).expect("write");

    let snapshot = service(&paths)
        .load("legacy", true, false)
        .expect("load with migrations");

    let source = &snapshot.data["modules"]["source"];
    assert_eq!(source["name"], "legacy");
    assert_eq!(source["path"], "/abs");
    assert_eq!(source["enabled"], true);
    assert_eq!(source["last_health"]["status"], "unknown");
    assert_eq!(snapshot.data["modules_version"], 1);
    for legacy_key in ["name", "path", "enabled", "target", "last_refresh_at", "last_health"] {
        assert!(
            snapshot.data.get(legacy_key).is_none(),
            "legacy key {legacy_key} should be relocated"
        );
    }
    let db = &snapshot.data["modules"]["db"];
    assert!(db["bootstrap_shortuuid7"].is_null());
    assert_eq!(db["pending_migrations"], json!([]));

    // The migrated document persisted with a backup of the original.
    let backups: Vec<_> = std::fs::read_dir(manifest_path.parent().unwrap())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
        .collect();
    assert_eq!(backups.len(), 1);
}

#[test]
fn migrator_is_idempotent() {
    let migrator = ManifestMigrator::new("modules", "db");
    let first = migrator.migrate(&json!({"name": "x", "path": "/p"}));
    assert!(first.applied);
    let second = migrator.migrate(&first.data);
    assert!(!second.applied);
    assert_eq!(second.data, first.data);
}

#[test]
fn dry_run_migration_does_not_persist() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let manifest_path = paths.source_manifest_path("dry");
    std::fs::create_dir_all(manifest_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&manifest_path, r#"{"name": "dry"}"#).expect("write");

    let snapshot = service(&paths).load("dry", true, true).expect("dry run");
    assert!(snapshot.data["modules"]["source"].is_object());

    let on_disk = std::fs::read_to_string(&manifest_path).expect("read");
    assert_eq!(on_disk, r#"{"name": "dry"}"#);
}

#[test]
fn backup_rotation_keeps_newest_by_retention() {
    let tmp = tempdir().expect("tempdir");
    let target = tmp.path().join("manifest.json");
    std::fs::write(&target, b"{}").expect("write");

    let base = time::macros::datetime!(2026-01-01 00:00:00 UTC);
    for step in 0..4 {
        create_backup(&target, ".bak", 2, base + time::Duration::hours(step)).expect("backup");
    }

    let mut backups: Vec<String> = std::fs::read_dir(tmp.path())
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".bak"))
        .collect();
    backups.sort();
    assert_eq!(backups.len(), 2, "retention keeps the newest two");
    assert_eq!(backups[0], "manifest.json.20260101T020000Z.bak");
    assert_eq!(backups[1], "manifest.json.20260101T030000Z.bak");
}

#[test]
fn transaction_runs_commit_hooks_in_order() {
    let tmp = tempdir().expect("tempdir");
    let service = service(&workspace(&tmp));

    let calls = Arc::new(AtomicUsize::new(0));
    let first = calls.clone();
    let second = calls.clone();
    service
        .with_transaction("alpha", true, move |txn| {
            txn.snapshot.ensure_modules();
            txn.snapshot.set_modules_version(MODULES_VERSION);
            txn.on_commit(move |_| {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
            });
            txn.on_commit(move |_| {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
            });
            Ok(())
        })
        .expect("transaction");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn transaction_body_error_runs_rollbacks_lifo_and_leaves_disk_untouched() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let service = service(&paths);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();
    let result: Result<(), RagmillError> = service.with_transaction("alpha", true, move |txn| {
        txn.snapshot.ensure_modules();
        txn.on_rollback(move |_| first.lock().unwrap().push("first"));
        txn.on_rollback(move |_| second.lock().unwrap().push("second"));
        Err(RagmillError::ParserError("boom".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    assert!(!paths.source_manifest_path("alpha").exists());
}

#[test]
fn snapshots_are_deep_copies() {
    let tmp = tempdir().expect("tempdir");
    let service = service(&workspace(&tmp));
    service
        .write("alpha", |snapshot| {
            snapshot.ensure_modules();
            snapshot.set_modules_version(MODULES_VERSION);
            Ok(())
        })
        .expect("write");

    let mut snapshot = service.load("alpha", false, false).expect("load");
    snapshot.data["modules_version"] = json!(999);

    let fresh = service.load("alpha", false, false).expect("reload");
    assert_eq!(fresh.data["modules_version"], 1);
}

#[test]
fn checksum_is_stable_over_key_order() {
    let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
    let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
    assert_eq!(compute_checksum(&a), compute_checksum(&b));
}

#[test]
fn manifest_lock_blocks_concurrent_writer() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);

    let manifest_path = paths.source_manifest_path("alpha");
    std::fs::create_dir_all(manifest_path.parent().unwrap()).expect("mkdir");
    let lock_path = manifest_path.with_file_name("manifest.json.lock");
    std::fs::write(&lock_path, b"").expect("hold lock");

    let mut settings = ManifestSettings::default();
    settings.lock_timeout = std::time::Duration::from_millis(80);
    settings.lock_poll_interval = std::time::Duration::from_millis(10);
    let service = ManifestService::new(paths.clone(), settings);

    match service.write("alpha", |_| Ok(())) {
        Err(RagmillError::LockTimeout(_)) => {}
        other => panic!("expected lock timeout, got {other:?}"),
    }
    std::fs::remove_file(&lock_path).expect("release");
}
