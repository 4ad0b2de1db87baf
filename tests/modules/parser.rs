use ragmill::core::config::{AppConfig, GitignoreBehavior, WorkspaceHandle};
use ragmill::core::health::HealthStatus;
use ragmill::core::paths::{resolve_workspace, WorkspacePaths};
use ragmill::modules::db::DbLifecycleService;
use ragmill::modules::parser::ParserService;
use ragmill::modules::parser_health::parser_health_hook;
use ragmill::modules::recompose::recompose_for_file;
use ragmill::modules::traversal::{TraversalScope, TraversalService};
use rusqlite::Connection;
use tempfile::tempdir;

const SAMPLE_PY: &str = "\
import os

def greet(name):
    \"\"\"Return a greeting.\"\"\"
    return f\"hello {name}\"


class Greeter:
    def run(self):
        return greet(\"world\")
";

const SAMPLE_HTML: &str = "\
<!doctype html>
<html>
  <head>
    <style>
      .badge { color: teal; }
    </style>
  </head>
  <body>
    <div id=\"app\"></div>
    <script>
      function boot() {
        console.log(\"ready\");
      }
      boot();
    </script>
  </body>
</html>
";

fn workspace(tmp: &tempfile::TempDir) -> WorkspacePaths {
    let paths = resolve_workspace(Some(&tmp.path().join("ws")), None).expect("resolve");
    paths.ensure_layout().expect("layout");
    paths
}

fn config_for(paths: &WorkspacePaths, source: &str, target: &std::path::Path) -> AppConfig {
    let text = format!(
        r#"
[workspace.sources.{source}]
enabled = true
path = "{}"

[modules.parser]
enabled = true
gitignore_behavior = "combined"
max_concurrency = 2
"#,
        target.display()
    );
    AppConfig::from_toml_str(&text).expect("config")
}

fn setup(
    tmp: &tempfile::TempDir,
    source: &str,
) -> (WorkspacePaths, AppConfig, std::path::PathBuf) {
    let paths = workspace(tmp);
    let target = paths.workspace.join("targets").join(source);
    std::fs::create_dir_all(&target).expect("target");
    let config = config_for(&paths, source, &target);
    (paths, config, target)
}

#[test]
fn plan_discovers_files_and_selects_handlers() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("sample.py"), SAMPLE_PY).expect("write");
    std::fs::write(target.join("notes.md"), "# Notes\nbody\n").expect("write");
    std::fs::write(target.join("README"), "plain body\n").expect("write");

    let parser = ParserService::new(paths, config).expect("parser");
    let plan = parser.plan_source("demo", None).expect("plan");

    assert_eq!(plan.metrics.files_discovered, 3);
    assert_eq!(plan.entries.len(), 3);
    assert!(plan.errors.is_empty());

    let mut selected: Vec<(String, String)> = plan
        .entries
        .iter()
        .map(|entry| {
            (
                entry.relative_path.to_string_lossy().to_string(),
                entry.handler.name.clone(),
            )
        })
        .collect();
    selected.sort();
    assert_eq!(
        selected,
        vec![
            ("README".to_string(), "text".to_string()),
            ("notes.md".to_string(), "markdown".to_string()),
            ("sample.py".to_string(), "python".to_string()),
        ]
    );
    assert!(plan.handler_versions.contains_key("python"));
}

#[test]
fn plan_respects_shebang_resolution() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("tool"), "#!/usr/bin/env python3\nprint(1)\n").expect("write");

    let parser = ParserService::new(paths, config).expect("parser");
    let plan = parser.plan_source("demo", None).expect("plan");
    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].handler.name, "python");
    assert_eq!(plan.entries[0].selection.resolved_via, "shebang:python3");
}

#[test]
fn traversal_honors_gitignore_and_workspace_patterns() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("tree");
    std::fs::create_dir_all(root.join("src")).expect("mkdir");
    std::fs::create_dir_all(root.join("build")).expect("mkdir");
    std::fs::write(root.join(".gitignore"), "build/\n*.tmp\n").expect("gitignore");
    std::fs::write(root.join("keep.txt"), "keep").expect("write");
    std::fs::write(root.join("scratch.tmp"), "drop").expect("write");
    std::fs::write(root.join("build").join("out.txt"), "drop").expect("write");
    std::fs::write(root.join("src").join("lib.rs"), "drop by workspace").expect("write");

    let service = TraversalService::new(
        &root,
        GitignoreBehavior::Combined,
        &["src/**".to_string()],
        false,
    )
    .expect("traversal");
    let mut names: Vec<String> = service
        .iter_files(None)
        .into_iter()
        .map(|entry| entry.relative_path.to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec![".gitignore".to_string(), "keep.txt".to_string()]);
}

#[test]
fn traversal_scope_skips_paths_outside_root() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("tree");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::write(root.join("inside.txt"), "in").expect("write");
    let outside = tmp.path().join("outside.txt");
    std::fs::write(&outside, "out").expect("write");

    let service =
        TraversalService::new(&root, GitignoreBehavior::None, &[], false).expect("traversal");
    let scope = TraversalScope::from_paths(vec![root.join("inside.txt"), outside]);
    let entries = service.iter_files(Some(&scope));
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].relative_path.to_string_lossy(),
        "inside.txt"
    );
}

#[test]
fn idempotent_parse_reuses_unchanged_chunks() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("sample.py"), SAMPLE_PY).expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");

    let first = parser
        .parse_source(&db, "demo", None, Some("run-1"))
        .expect("first run");
    let batch_1 = first.batch_id.clone().expect("batch id");
    assert_eq!(first.metrics.files_parsed, 1);
    assert_eq!(first.metrics.files_reused, 0);
    let emitted = first.metrics.chunks_emitted;
    assert!(emitted > 0, "first run inserts chunks");
    assert_eq!(first.metrics.chunks_reused, 0);

    let second = parser
        .parse_source(&db, "demo", None, Some("run-2"))
        .expect("second run");
    let batch_2 = second.batch_id.clone().expect("batch id");
    assert_ne!(batch_1, batch_2);
    assert_eq!(second.metrics.files_reused, 1);
    assert_eq!(second.metrics.files_parsed, 0);
    assert_eq!(second.metrics.chunks_emitted, 0);
    assert_eq!(second.metrics.chunks_reused, emitted);

    let conn = Connection::open(paths.source_database_path("demo")).expect("open");
    let mut stmt = conn
        .prepare("SELECT first_seen_batch, last_seen_batch FROM chunk_slices")
        .expect("prepare");
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query")
        .map(|row| row.expect("row"))
        .collect();
    assert!(!rows.is_empty());
    for (first_seen, last_seen) in rows {
        assert_eq!(first_seen, batch_1);
        assert_eq!(last_seen, batch_2);
    }
}

#[test]
fn changed_file_inserts_fresh_chunks() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("note.txt"), "alpha\n\nbeta\n").expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    parser
        .parse_source(&db, "demo", None, None)
        .expect("first run");

    std::fs::write(target.join("note.txt"), "alpha\n\nbeta\n\ngamma\n").expect("rewrite");
    let second = parser
        .parse_source(&db, "demo", None, None)
        .expect("second run");
    assert!(second.metrics.chunks_emitted > 0);
    assert_eq!(second.metrics.files_reused, 0);
}

#[test]
fn delegated_chunks_persist_and_recompose() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("page.html"), SAMPLE_HTML).expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    let run = parser
        .parse_source(&db, "demo", None, None)
        .expect("parse");
    let batch_id = run.batch_id.expect("batch id");

    let conn = Connection::open(paths.source_database_path("demo")).expect("open");
    let mut stmt = conn
        .prepare(
            "SELECT chunk_id, handler_name, metadata_json FROM chunk_slices WHERE batch_id = ?1",
        )
        .expect("prepare");
    let rows: Vec<(String, String, Option<String>)> = stmt
        .query_map([&batch_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .expect("query")
        .map(|row| row.expect("row"))
        .collect();

    let shell = rows
        .iter()
        .find(|(_, handler, _)| handler == "html")
        .expect("html shell chunk");
    let script = rows
        .iter()
        .find(|(_, handler, _)| handler == "javascript")
        .expect("delegated javascript chunk");
    let style = rows
        .iter()
        .find(|(_, handler, _)| handler == "css")
        .expect("delegated css chunk");

    for delegated in [script, style] {
        let metadata: serde_json::Value =
            serde_json::from_str(delegated.2.as_deref().expect("metadata")).expect("json");
        assert_eq!(
            metadata["delegate_parent_chunk"].as_str().expect("parent"),
            shell.0,
            "delegate links back to the shell chunk"
        );
    }

    let file_id: i64 = conn
        .query_row("SELECT id FROM files WHERE repo_path = 'page.html'", [], |row| {
            row.get(0)
        })
        .expect("file id");
    let roots = recompose_for_file(&conn, &batch_id, file_id).expect("recompose");
    assert_eq!(roots.len(), 1, "one root: the document shell");
    let root = &roots[0];
    assert_eq!(root.handler_name, "html");
    let child_handlers: Vec<&str> = root
        .delegate_children
        .iter()
        .map(|child| child.handler_name.as_str())
        .collect();
    assert!(child_handlers.contains(&"javascript"));
    assert!(child_handlers.contains(&"css"));
    assert!(root
        .delegate_children
        .iter()
        .any(|child| child.text.contains("console.log")));
}

#[test]
fn token_cap_splitting_keeps_parts_contiguous() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);
    let target = paths.workspace.join("targets").join("demo");
    std::fs::create_dir_all(&target).expect("target");
    let body = (0..120)
        .map(|index| format!("line number {index} with some padding text\n"))
        .collect::<String>();
    std::fs::write(target.join("big.txt"), &body).expect("write");

    let text = format!(
        r#"
[workspace.sources.demo]
enabled = true
path = "{}"

[modules.parser]
general_max_tokens = 32
"#,
        target.display()
    );
    let config = AppConfig::from_toml_str(&text).expect("config");
    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    let run = parser.parse_source(&db, "demo", None, None).expect("parse");
    let batch_id = run.batch_id.expect("batch");

    let conn = Connection::open(paths.source_database_path("demo")).expect("open");
    let mut stmt = conn
        .prepare(
            "SELECT chunk_id, part_index, part_total, overflow_is_truncated, overflow_reason
             FROM chunk_slices WHERE batch_id = ?1 ORDER BY chunk_id, part_index",
        )
        .expect("prepare");
    let rows: Vec<(String, i64, i64, bool, Option<String>)> = stmt
        .query_map([&batch_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .expect("query")
        .map(|row| row.expect("row"))
        .collect();

    let split_chunk = rows
        .iter()
        .filter(|(_, _, total, _, _)| *total > 1)
        .map(|(chunk_id, _, _, _, _)| chunk_id.clone())
        .next()
        .expect("at least one split chunk");

    let parts: Vec<&(String, i64, i64, bool, Option<String>)> = rows
        .iter()
        .filter(|(chunk_id, _, _, _, _)| chunk_id == &split_chunk)
        .collect();
    let total = parts[0].2;
    assert_eq!(parts.len() as i64, total);
    for (expected_index, part) in parts.iter().enumerate() {
        assert_eq!(part.1, expected_index as i64, "contiguous part indexes");
        assert_eq!(part.2, total, "part_total constant across parts");
        assert!(part.3, "split parts are flagged as overflow");
        assert_eq!(part.4.as_deref(), Some("max_tokens"));
    }
}

#[test]
fn run_record_lands_in_manifest_and_health_passes() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("sample.py"), SAMPLE_PY).expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    let run = parser.parse_source(&db, "demo", None, None).expect("parse");
    assert_eq!(run.status, HealthStatus::Ok);

    let state = parser.load_manifest_state("demo").expect("state");
    assert_eq!(state.last_batch_id, run.batch_id);
    assert_eq!(state.last_run_status, HealthStatus::Ok);
    assert_eq!(state.metrics.files_discovered, 1);
    assert_eq!(state.handler_versions.get("python").map(String::as_str), Some("1.0.0"));

    let handle = WorkspaceHandle {
        paths: paths.clone(),
        config,
    };
    let reports = parser_health_hook(&handle);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, HealthStatus::Ok, "{:?}", reports[0].summary);
}

#[test]
fn parser_health_flags_missing_batch_row() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("sample.py"), SAMPLE_PY).expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    let run = parser.parse_source(&db, "demo", None, None).expect("parse");
    let batch_id = run.batch_id.expect("batch");

    let conn = Connection::open(paths.source_database_path("demo")).expect("open");
    conn.execute("DELETE FROM chunk_slices WHERE batch_id = ?1", [&batch_id])
        .expect("drop slices");
    conn.execute("DELETE FROM batches WHERE id = ?1", [&batch_id])
        .expect("drop batch");
    drop(conn);

    let handle = WorkspaceHandle {
        paths: paths.clone(),
        config,
    };
    let reports = parser_health_hook(&handle);
    assert_eq!(reports[0].status, HealthStatus::Error);
    assert!(reports[0]
        .summary
        .as_deref()
        .unwrap()
        .contains("missing from batches table"));
}

#[test]
fn parser_errors_collect_instead_of_raising() {
    let tmp = tempdir().expect("tempdir");
    let (paths, config, target) = setup(&tmp, "demo");
    std::fs::write(target.join("binary.txt"), [0xFFu8, 0xFE, 0x00, 0x80]).expect("write");

    let parser = ParserService::new(paths.clone(), config.clone()).expect("parser");
    let db = DbLifecycleService::new(paths.clone(), &config).expect("db");
    let run = parser.parse_source(&db, "demo", None, None).expect("parse");

    assert_eq!(run.status, HealthStatus::Error);
    assert!(run
        .errors
        .iter()
        .any(|error| error.contains("not valid UTF-8")));
}

#[test]
fn disabled_module_and_unknown_source_are_typed_errors() {
    let tmp = tempdir().expect("tempdir");
    let paths = workspace(&tmp);

    let disabled = AppConfig::from_toml_str("[modules.parser]\nenabled = false\n").expect("config");
    let parser = ParserService::new(paths.clone(), disabled).expect("parser");
    assert!(matches!(
        parser.plan_source("demo", None),
        Err(ragmill::core::error::RagmillError::ParserModuleDisabled(_))
    ));

    let empty = AppConfig::default();
    let parser = ParserService::new(paths, empty).expect("parser");
    assert!(matches!(
        parser.plan_source("demo", None),
        Err(ragmill::core::error::RagmillError::ParserSourceNotConfigured(_))
    ));
}
