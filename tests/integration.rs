use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::process::Command;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Statewide alerts</title>
  <item>
    <title>AMBER Alert: Maria Lopez, 7, abducted from San Antonio, TX</title>
    <description>Maria is a 7-year-old girl last seen wearing a red jacket.</description>
    <guid>alert-1</guid>
    <pubDate>Wed, 01 May 2024 14:30:00 +0000</pubDate>
  </item>
  <item>
    <title>Missing: John Smith (15)</title>
    <description>Last seen in Dallas, TX. He is a male, 5'8.</description>
    <guid>missing-2</guid>
  </item>
  <item>
    <title>Jane Roe (16) missing from Tampa, FL</title>
    <description>Jane is a 16-year-old girl.</description>
    <guid>missing-3</guid>
  </item>
</channel></rss>"#;

fn cw_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cw");
    path
}

fn setup_test_env(base_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/casewatch.sqlite"

[http]
max_retries = 0
timeout_secs = 5

[scheduler]
batch_delay_secs = 1

[geocoding]
cache_path = "{root}/data/geocache.json"
providers = []

[sources.state_feed]
name = "State alert feed"
adapter = "rss"
base_url = "{base}"
feeds = ["/alerts.xml"]
requests_per_minute = 600
burst = 50
interval_minutes = 30
priority = "critical"

[sources.broken_feed]
name = "Broken feed"
adapter = "rss"
base_url = "{base}"
feeds = ["/missing.xml"]
requests_per_minute = 600
burst = 50
priority = "low"

[sources.old_portal]
name = "Retired portal"
adapter = "html_scraper"
base_url = "{base}"
pages = ["/cases.html"]
enabled = false
"#,
        root = root.display(),
        base = base_url
    );

    let config_path = config_dir.join("casewatch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

async fn run_cw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cw_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .await
        .unwrap_or_else(|e| panic!("Failed to run cw binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn feed_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_init_creates_database() {
    let (tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (stdout, stderr, ok) = run_cw(&config, &["init"]).await;
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/casewatch.sqlite").exists());
}

#[tokio::test]
async fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (_, _, ok1) = run_cw(&config, &["init"]).await;
    let (_, _, ok2) = run_cw(&config, &["init"]).await;
    assert!(ok1 && ok2);
}

#[tokio::test]
async fn test_sources_lists_status() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (stdout, stderr, ok) = run_cw(&config, &["sources"]).await;
    assert!(ok, "sources failed: {}", stderr);

    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("SOURCE"));
    // critical first
    assert!(lines[1].starts_with("state_feed"));
    let portal = lines.iter().find(|l| l.starts_with("old_portal")).unwrap();
    assert!(portal.contains("inactive"));
    assert!(portal.contains("scraper"));
}

#[tokio::test]
async fn test_empty_store_listings() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    run_cw(&config, &["init"]).await;

    let (stdout, _, ok) = run_cw(&config, &["history"]).await;
    assert!(ok);
    assert!(stdout.contains("No sync history."));

    let (stdout, _, ok) = run_cw(&config, &["events"]).await;
    assert!(ok);
    assert!(stdout.contains("No change events."));

    let (stdout, _, ok) = run_cw(&config, &["stats"]).await;
    assert!(ok);
    assert!(stdout.contains("0 pending"));

    let (stdout, _, ok) = run_cw(&config, &["cluster"]).await;
    assert!(ok);
    assert_eq!(stdout.trim(), "[]");

    let (stdout, _, ok) = run_cw(&config, &["reprocess-failed"]).await;
    assert!(ok);
    assert!(stdout.contains("Moved 0 failed records"));
}

#[tokio::test]
async fn test_unknown_source_fails() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (_, stderr, ok) = run_cw(&config, &["sync", "nope"]).await;
    assert!(!ok);
    assert!(stderr.contains("Unknown source"));

    let (_, stderr, ok) = run_cw(&config, &["reset-source", "nope"]).await;
    assert!(!ok);
    assert!(stderr.contains("Unknown source"));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("bad.toml");
    fs::write(
        &config,
        r#"[db]
path = "./x.sqlite"

[sources.x]
name = "X"
adapter = "telepathy"
base_url = "https://example.org"
"#,
    )
    .unwrap();
    let (_, stderr, ok) = run_cw(&config, &["sources"]).await;
    assert!(!ok);
    assert!(stderr.contains("unknown adapter"));
}

#[tokio::test]
async fn test_cluster_rejects_bad_overrides() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");
    let (_, stderr, ok) = run_cw(&config, &["cluster", "--algorithm", "astrology"]).await;
    assert!(!ok);
    assert!(stderr.contains("Unknown clustering algorithm"));

    let (_, _, ok) = run_cw(&config, &["cluster", "--min-points", "0"]).await;
    assert!(!ok);
}

#[tokio::test]
async fn test_sync_process_events() {
    let server = feed_server().await;
    let (_tmp, config) = setup_test_env(&server.uri());
    run_cw(&config, &["init"]).await;

    let (stdout, stderr, ok) = run_cw(&config, &["sync", "state_feed"]).await;
    assert!(ok, "sync failed: {}", stderr);
    assert!(stdout.contains("ok"), "unexpected output: {}", stdout);
    assert!(stdout.contains("3 added"));

    // same content again: nothing new
    let (stdout, _, ok) = run_cw(&config, &["sync", "state_feed"]).await;
    assert!(ok);
    assert!(stdout.contains("3 skipped"));

    let (stdout, _, ok) = run_cw(&config, &["history", "--source", "state_feed"]).await;
    assert!(ok);
    assert_eq!(stdout.lines().filter(|l| l.contains("state_feed")).count(), 2);

    let (stdout, stderr, ok) = run_cw(&config, &["process"]).await;
    assert!(ok, "process failed: {}", stderr);
    assert!(stdout.contains("Processed"));

    let (stdout, _, ok) = run_cw(&config, &["stats"]).await;
    assert!(ok);
    assert!(stdout.contains("0 pending"));
    assert!(stdout.contains("state_feed"));

    let (stdout, _, ok) = run_cw(&config, &["events"]).await;
    assert!(ok);
    let amber = stdout
        .lines()
        .find(|l| l.contains("amber_alert"))
        .expect("amber alert event");
    assert!(amber.contains("critical"));
    assert!(amber.contains("Maria Lopez"));

    // processed records are not processed again
    let (stdout, _, ok) = run_cw(&config, &["process"]).await;
    assert!(ok);
    assert!(stdout.contains("Processed 0 records"));
}

#[tokio::test]
async fn test_failed_source_recorded_in_history() {
    let server = feed_server().await;
    let (_tmp, config) = setup_test_env(&server.uri());
    run_cw(&config, &["init"]).await;

    // /missing.xml is not mounted, the mock server answers 404
    let (stdout, _, ok) = run_cw(&config, &["sync", "broken_feed"]).await;
    assert!(ok);
    assert!(stdout.contains("FAILED"));

    let (stdout, _, _) = run_cw(&config, &["history"]).await;
    assert!(stdout.contains("broken_feed"));
    assert!(stdout.contains("failed"));

    let (stdout, _, _) = run_cw(&config, &["sources"]).await;
    let row = stdout
        .lines()
        .find(|l| l.starts_with("broken_feed"))
        .unwrap();
    assert!(row.contains("active"));
    assert!(stdout.contains("last error:"));

    let (stdout, stderr, ok) = run_cw(&config, &["reset-source", "broken_feed"]).await;
    assert!(ok, "reset failed: {}", stderr);
    assert!(stdout.contains("reset to active"));
}

#[tokio::test]
async fn test_sync_all_in_batches() {
    let server = feed_server().await;
    let (_tmp, config) = setup_test_env(&server.uri());
    run_cw(&config, &["init"]).await;

    let (stdout, stderr, ok) = run_cw(&config, &["sync", "all", "--batch-size", "1"]).await;
    assert!(ok, "sync all failed: {}", stderr);
    // the disabled portal is not part of `all`
    assert!(!stdout.contains("old_portal"));
    assert!(stdout.contains("state_feed"));
    assert!(stdout.contains("broken_feed"));
}

#[tokio::test]
async fn test_geocode_without_providers() {
    let (_tmp, config) = setup_test_env("http://127.0.0.1:9");

    let (_, stderr, ok) = run_cw(&config, &["geocode", "lookup", "Miami", "FL"]).await;
    assert!(!ok);
    assert!(stderr.contains("No geocoding result"));

    let (stdout, _, ok) = run_cw(&config, &["geocode", "stats"]).await;
    assert!(ok);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["cache_entries"], 0);
    assert!(stats["configured_providers"].as_array().unwrap().is_empty());

    let (stdout, _, ok) = run_cw(&config, &["geocode", "clear"]).await;
    assert!(ok);
    assert!(stdout.contains("Cleared 0"));
}
