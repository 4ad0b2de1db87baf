use ragmill::core::config::{AppConfig, WorkspaceHandle};
use ragmill::core::error::RagmillError;
use ragmill::core::health::HealthStatus;
use ragmill::core::paths::{resolve_workspace, WorkspacePaths};
use ragmill::modules::db::{DbLifecycleService, DbManifestState};
use ragmill::modules::db_health::db_health_hook;
use ragmill::modules::migrations::MigrationRunner;
use rusqlite::Connection;
use tempfile::tempdir;

const BOOTSTRAP: &str = "06801HWW01TV";
const PARSER_TABLES: &str = "06801M63R1ST";
const VDB_TABLES: &str = "06801PFBG1YK";

fn workspace(tmp: &tempfile::TempDir) -> WorkspacePaths {
    let paths = resolve_workspace(Some(&tmp.path().join("ws")), None).expect("resolve");
    paths.ensure_layout().expect("layout");
    paths
}

fn config_with_source(paths: &WorkspacePaths, source: &str, auto_upgrade: bool) -> AppConfig {
    let target = paths.workspace.join("targets").join(source);
    std::fs::create_dir_all(&target).expect("target dir");
    let text = format!(
        r#"
[workspace.sources.{source}]
enabled = true
path = "{}"

[db]
ensure_auto_upgrade = {auto_upgrade}
"#,
        target.display()
    );
    AppConfig::from_toml_str(&text).expect("config")
}

fn manifest_db_state(paths: &WorkspacePaths, source: &str) -> DbManifestState {
    let text = std::fs::read_to_string(paths.source_manifest_path(source)).expect("manifest");
    let document: serde_json::Value = serde_json::from_str(&text).expect("json");
    let payload = document["modules"]["db"].as_object().expect("db payload");
    DbManifestState::from_map(Some(payload))
}

#[test]
fn ensure_bootstraps_fresh_workspace() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    let db_path = service.ensure("alpha").expect("ensure");
    assert!(db_path.exists());
    assert_eq!(db_path, paths.source_database_path("alpha"));

    let state = manifest_db_state(&paths, "alpha");
    assert_eq!(state.bootstrap_shortuuid7.as_deref(), Some(BOOTSTRAP));
    assert!(state.last_ensure_at.is_some());
    assert!(state.pending_migrations.is_empty(), "auto-upgrade applied all");
    assert_eq!(state.head_migration_shortuuid7.as_deref(), Some(VDB_TABLES));

    let text = std::fs::read_to_string(paths.source_manifest_path("alpha")).expect("manifest");
    let document: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(document["modules_version"], 1);

    let conn = Connection::open(&db_path).expect("open");
    let meta_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_meta", [], |row| row.get(0))
        .expect("meta count");
    assert_eq!(meta_rows, 1);
    let applied: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT shortuuid7) FROM schema_migrations WHERE direction = 'up'",
            [],
            |row| row.get(0),
        )
        .expect("applied count");
    assert_eq!(applied, 3);
}

#[test]
fn ensure_is_idempotent_under_retry() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    service.ensure("alpha").expect("first ensure");
    let first = manifest_db_state(&paths, "alpha");
    service.ensure("alpha").expect("second ensure");
    let second = manifest_db_state(&paths, "alpha");

    assert_eq!(first.ledger_checksum, second.ledger_checksum);
    assert_eq!(first.head_migration_shortuuid7, second.head_migration_shortuuid7);
    assert!(second.last_ensure_at >= first.last_ensure_at);
}

#[test]
fn upgrade_then_downgrade_round_trip() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", false);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    service.ensure("alpha").expect("ensure");
    let bootstrapped = manifest_db_state(&paths, "alpha");
    assert_eq!(
        bootstrapped.pending_migrations,
        vec![PARSER_TABLES.to_string(), VDB_TABLES.to_string()]
    );
    assert_eq!(
        bootstrapped.head_migration_shortuuid7.as_deref(),
        Some(BOOTSTRAP)
    );

    let applied = service.upgrade("alpha", None).expect("upgrade");
    assert_eq!(applied, vec![PARSER_TABLES.to_string(), VDB_TABLES.to_string()]);

    let rolled_back = service.downgrade("alpha", 1).expect("downgrade");
    assert_eq!(rolled_back, vec![VDB_TABLES.to_string()]);

    let state = manifest_db_state(&paths, "alpha");
    assert_eq!(state.head_migration_shortuuid7.as_deref(), Some(PARSER_TABLES));
    assert_eq!(state.pending_migrations, vec![VDB_TABLES.to_string()]);

    let runner = MigrationRunner::from_embedded().expect("runner");
    let expected = runner
        .ledger_checksum(&[BOOTSTRAP.to_string(), PARSER_TABLES.to_string()])
        .expect("ledger");
    assert_eq!(state.ledger_checksum.as_deref(), Some(expected.as_str()));

    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    let has_vdbs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'vdbs'",
            [],
            |row| row.get(0),
        )
        .expect("table lookup");
    assert_eq!(has_vdbs, 0, "downgrade dropped the vdb tables");
}

#[test]
fn downgrade_stops_at_bootstrap() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    service.ensure("alpha").expect("ensure");
    let rolled_back = service.downgrade("alpha", 10).expect("downgrade");
    assert_eq!(
        rolled_back,
        vec![VDB_TABLES.to_string(), PARSER_TABLES.to_string()],
        "bootstrap is never rolled back"
    );

    let state = manifest_db_state(&paths, "alpha");
    assert_eq!(state.head_migration_shortuuid7.as_deref(), Some(BOOTSTRAP));
}

#[test]
fn overlapping_ensures_serialize_on_the_db_lock() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);

    let first_paths = paths.clone();
    let first_config = config.clone();
    let first = std::thread::spawn(move || {
        let service = DbLifecycleService::new(first_paths, &first_config).expect("service");
        service.ensure("alpha").expect("ensure one");
    });
    let second_paths = paths.clone();
    let second_config = config.clone();
    let second = std::thread::spawn(move || {
        let service = DbLifecycleService::new(second_paths, &second_config).expect("service");
        service.ensure("alpha").expect("ensure two");
    });
    first.join().expect("join one");
    second.join().expect("join two");

    let state = manifest_db_state(&paths, "alpha");
    assert_eq!(state.bootstrap_shortuuid7.as_deref(), Some(BOOTSTRAP));
    assert!(state.last_ensure_at.is_some());

    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    let meta_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_meta", [], |row| row.get(0))
        .expect("meta count");
    assert_eq!(meta_rows, 1, "bootstrap ran exactly once");
}

#[test]
fn run_requires_an_existing_script() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    match service.run("alpha", &paths.workspace.join("missing.sql"), false) {
        Err(RagmillError::DbLifecycle(message)) => {
            assert!(message.contains("SQL script not found"));
        }
        other => panic!("expected lifecycle error, got {other:?}"),
    }
}

#[test]
fn run_executes_manual_sql() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");

    let script = paths.workspace.join("manual.sql");
    std::fs::write(
        &script,
        "CREATE TABLE scratch (id INTEGER PRIMARY KEY, note TEXT);\n",
    )
    .expect("script");
    service.run("alpha", &script, false).expect("run");

    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    conn.execute("INSERT INTO scratch (note) VALUES ('hi')", [])
        .expect("insert into scratch");
}

#[test]
fn reset_requires_force_and_rebootstraps() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");

    assert!(service.reset("alpha", false).is_err());

    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    conn.execute_batch("CREATE TABLE scratch (id INTEGER);")
        .expect("scratch table");
    drop(conn);

    service.reset("alpha", true).expect("reset");
    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    let scratch: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch'",
            [],
            |row| row.get(0),
        )
        .expect("lookup");
    assert_eq!(scratch, 0, "reset rebuilt the schema from migrations");

    let state = manifest_db_state(&paths, "alpha");
    assert_eq!(state.bootstrap_shortuuid7.as_deref(), Some(BOOTSTRAP));
}

#[test]
fn info_reports_table_counts() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");

    let payload = service.info("alpha", true, true).expect("info");
    assert_eq!(payload["source"], "alpha");
    assert!(payload["schema"].as_str().unwrap().contains("chunk_slices"));
    let counts = payload["table_counts"].as_object().expect("counts");
    assert_eq!(counts["batches"], 0);
    assert!(counts.contains_key("files"));
}

#[test]
fn health_reports_pending_migrations_and_stale_vacuum() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let mut config = config_with_source(&paths, "alpha", false);
    config.db.vacuum_max_stale_days = 7;
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");

    // Backdate vacuum 30 days into the past.
    let stale = ragmill::core::time::to_rfc3339(
        ragmill::core::time::now_utc() - time::Duration::days(30),
    );
    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    conn.execute(
        "UPDATE schema_meta SET last_vacuum_at = ?1 WHERE id = 1",
        [&stale],
    )
    .expect("backdate vacuum");
    drop(conn);

    let handle = WorkspaceHandle {
        paths: paths.clone(),
        config,
    };
    let reports = db_health_hook(&handle);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, HealthStatus::Degraded);
    let summary = report.summary.as_deref().unwrap();
    assert!(summary.contains("pending migrations:"), "summary: {summary}");
    assert!(summary.contains("vacuum stale (30 days"), "summary: {summary}");
    assert!(report
        .actions
        .iter()
        .any(|action| action.contains("db upgrade alpha")));
    assert!(report
        .actions
        .iter()
        .any(|action| action.contains("db vacuum alpha")));
}

#[test]
fn health_flags_missing_database() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");
    std::fs::remove_file(paths.source_database_path("alpha")).expect("remove db");

    let handle = WorkspaceHandle {
        paths: paths.clone(),
        config,
    };
    let reports = db_health_hook(&handle);
    assert_eq!(reports[0].status, HealthStatus::Error);
    assert!(reports[0]
        .actions
        .iter()
        .any(|action| action.contains("db ensure alpha")));
}

#[test]
fn health_detects_ledger_tampering() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let config = config_with_source(&paths, "alpha", true);
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");
    service.ensure("alpha").expect("ensure");

    let conn = Connection::open(paths.source_database_path("alpha")).expect("open");
    conn.execute(
        "UPDATE schema_meta SET ledger_checksum = 'sha256:0000' WHERE id = 1",
        [],
    )
    .expect("tamper");
    drop(conn);

    let handle = WorkspaceHandle {
        paths: paths.clone(),
        config,
    };
    let reports = db_health_hook(&handle);
    assert_eq!(reports[0].status, HealthStatus::Error);
    assert!(reports[0]
        .summary
        .as_deref()
        .unwrap()
        .contains("Ledger checksum mismatch"));
}

#[test]
fn lock_timeout_maps_to_typed_error() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let text = r#"
[workspace.sources.alpha]
enabled = true
path = "/tmp"

[db]
lock_timeout = 0.05
lock_poll_interval = 0.01
"#;
    let config = AppConfig::from_toml_str(text).expect("config");
    let service = DbLifecycleService::new(paths.clone(), &config).expect("service");

    // Hold the lock out-of-band so ensure must time out.
    let lock_path = service.lock_path("alpha");
    std::fs::create_dir_all(lock_path.parent().unwrap()).expect("mkdir");
    std::fs::write(&lock_path, b"").expect("hold");

    match service.ensure("alpha") {
        Err(RagmillError::LockTimeout(message)) => {
            assert!(message.contains("ensure"));
            assert!(message.contains("alpha"));
        }
        other => panic!("expected lock timeout, got {other:?}"),
    }
}
