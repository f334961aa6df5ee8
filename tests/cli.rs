use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn pidx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pidx"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let feeds = root.join("feeds");
    fs::create_dir_all(feeds.join("marketplaces")).unwrap();
    fs::write(
        feeds.join("marketplaces/dump.json"),
        r#"[
            {"id": "mk-acme", "namespace": "acme", "name": "Acme Tools", "stars": "1.2k", "plugin_count": 4},
            {"id": "mk-beta", "namespace": "beta", "name": "Beta Kit", "stars": 17}
        ]"#,
    )
    .unwrap();
    fs::write(
        feeds.join("servers.json"),
        r#"{"items": [{"id": "srv-1", "name": "Weather MCP", "repository": "https://github.com/acme/weather"}]}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/index.sqlite"

[server]
bind = "127.0.0.1:0"

[connectors.marketplaces]
kind = "file"
path = "{root}/feeds/marketplaces"

[connectors.mcp-servers]
kind = "file"
path = "{root}/feeds/servers.json"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("pidx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_pidx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = pidx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pidx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pidx(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));
    assert!(tmp.path().join("data/index.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pidx(&config_path, &["init"]);
    assert!(success, "first init failed: {}", stderr);
    let (_, stderr, success) = run_pidx(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_sources_lists_every_stage() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pidx(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);

    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("STAGE"));
    let marketplaces = lines.iter().find(|l| l.starts_with("marketplaces")).unwrap();
    assert!(marketplaces.contains("file"));
    assert!(marketplaces.trim_end().ends_with("true"));
    let plugins = lines.iter().find(|l| l.starts_with("plugins")).unwrap();
    assert!(plugins.contains("NOT CONFIGURED"));
}

#[test]
fn test_run_prints_json_report() {
    let (_tmp, config_path) = setup_test_env();
    run_pidx(&config_path, &["init"]);

    let (stdout, stderr, success) = run_pidx(&config_path, &["run", "marketplaces"]);
    assert!(success, "run failed: {}", stderr);

    let report: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["pipeline"], "marketplaces");
    assert_eq!(report["trigger"], "cli");
    assert_eq!(report["success"], true);
    assert_eq!(report["stages"][0]["created"], 2);

    // A second run over identical input writes nothing new.
    let (stdout, _, success) = run_pidx(&config_path, &["run", "marketplaces"]);
    assert!(success);
    let report: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["stages"][0]["created"], 0);
    assert_eq!(report["stages"][0]["unchanged"], 2);
}

#[test]
fn test_run_rejects_unknown_pipeline() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pidx(&config_path, &["run", "everything"]);
    assert!(!success);
    assert!(stderr.contains("everything"));
}

#[test]
fn test_scheduled_picks_pipeline_for_the_day() {
    let (_tmp, config_path) = setup_test_env();
    run_pidx(&config_path, &["init"]);

    // 2026-03-03 is a Tuesday: MCP servers.
    let (stdout, stderr, success) =
        run_pidx(&config_path, &["scheduled", "--at", "2026-03-03T06:00:00Z"]);
    assert!(success, "scheduled failed: {}", stderr);

    let scheduled: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(scheduled["pipeline"], "mcp-servers");
    assert_eq!(scheduled["attempts"], 1);
    assert_eq!(scheduled["report"]["stages"][0]["created"], 1);
}

#[test]
fn test_runs_and_status_after_a_run() {
    let (_tmp, config_path) = setup_test_env();
    run_pidx(&config_path, &["init"]);
    run_pidx(&config_path, &["run", "marketplaces"]);

    let (stdout, stderr, success) = run_pidx(&config_path, &["runs"]);
    assert!(success, "runs failed: {}", stderr);
    let rows: Vec<&str> = stdout.lines().skip(1).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].contains("marketplaces"));
    assert!(rows[0].contains("ok"));

    let (stdout, stderr, success) = run_pidx(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("marketplace"));
    assert!(stdout.contains("Snapshots:   2"));
}

#[test]
fn test_trend_for_unknown_entity_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_pidx(&config_path, &["init"]);

    let (_, stderr, success) = run_pidx(&config_path, &["trend", "does-not-exist"]);
    assert!(!success);
    assert!(stderr.contains("no entity with id does-not-exist"));
}
