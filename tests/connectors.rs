//! Built-in connector tests: JSON files on disk and JSON feeds over HTTP.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use plugin_index::config::{FileConnectorConfig, HttpConnectorConfig};
use plugin_index::connector_file::{scan_files, FileConnector};
use plugin_index::connector_http::HttpConnector;
use plugin_index::error::ConnectorError;
use plugin_index::traits::{Connector, PreviousState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── File connector ─────────────────────────────────────────────────

fn file_config(path: &Path) -> FileConnectorConfig {
    FileConnectorConfig {
        path: path.to_path_buf(),
        include_globs: vec!["**/*.json".into()],
        exclude_globs: vec![],
    }
}

#[tokio::test]
async fn file_connector_reads_arrays_and_item_objects() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("a.json"),
        json!([{"id": "a-1", "name": "A"}, {"id": "a-2", "name": "B"}]).to_string(),
    )
    .unwrap();
    fs::create_dir_all(tmp.path().join("nested")).unwrap();
    fs::write(
        tmp.path().join("nested/b.json"),
        json!({"items": [{"namespace": "c", "stars": "1.5k"}]}).to_string(),
    )
    .unwrap();
    fs::write(tmp.path().join("notes.txt"), "not a record file").unwrap();

    let connector = FileConnector::new("file:marketplaces".into(), file_config(tmp.path()));
    let result = connector.run(None).await.unwrap();

    assert!(result.complete);
    assert!(result.source_errors.is_empty());
    assert_eq!(result.items.len(), 3);
    assert_eq!(result.items[0].external_id.as_deref(), Some("a-1"));
    assert_eq!(result.items[2].namespace.as_deref(), Some("c"));
    assert_eq!(connector.name(), "file:marketplaces");
}

#[test]
fn file_connector_honors_exclude_globs() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("keep.json"), "[{\"name\": \"keep\"}]").unwrap();
    fs::create_dir_all(tmp.path().join("drafts")).unwrap();
    fs::write(tmp.path().join("drafts/skip.json"), "[{\"name\": \"skip\"}]").unwrap();

    let mut config = file_config(tmp.path());
    config.exclude_globs = vec!["drafts/**".into()];
    let result = scan_files(&config).unwrap();

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].name.as_deref(), Some("keep"));
}

#[test]
fn bad_elements_are_source_errors_and_bad_files_make_listing_partial() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("mixed.json"),
        json!([{"id": "ok-1"}, "not an object", {"id": "ok-2", "categories": "oops"}, {"id": "ok-3"}])
            .to_string(),
    )
    .unwrap();

    let result = scan_files(&file_config(tmp.path())).unwrap();
    assert_eq!(result.items.len(), 2);
    assert_eq!(result.source_errors.len(), 2);
    assert!(result.source_errors[0].contains("mixed.json[1]"));
    // Element errors do not make the listing partial.
    assert!(result.complete);

    fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
    let result = scan_files(&file_config(tmp.path())).unwrap();
    assert_eq!(result.items.len(), 2);
    assert!(!result.complete);
    assert!(result
        .source_errors
        .iter()
        .any(|e| e.contains("broken.json") && e.contains("invalid JSON")));
}

#[test]
fn single_file_path_is_read_directly() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("servers.data");
    fs::write(&file, "[{\"id\": \"s-1\"}]").unwrap();

    let result = scan_files(&file_config(&file)).unwrap();
    assert_eq!(result.items.len(), 1);
}

#[test]
fn missing_path_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let err = scan_files(&file_config(&tmp.path().join("nope"))).unwrap_err();
    assert!(matches!(err, ConnectorError::Unavailable(ref m) if m.contains("does not exist")));
}

// ─── HTTP connector ─────────────────────────────────────────────────

#[derive(Clone, Default)]
struct FeedState {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn feed(
    State(state): State<FeedState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "Bearer feed-token")
        .unwrap_or(false);
    if !authorized {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.queries.lock().unwrap().push(query);
    Ok(Json(json!({
        "items": [
            {"id": "srv-1", "name": "One", "stars": 12},
            {"id": "srv-2", "name": "Two", "downloads": "3,400"},
            42
        ]
    })))
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn serve_feed() -> (String, FeedState) {
    let state = FeedState::default();
    let app = Router::new()
        .route("/servers", get(feed))
        .route("/broken", get(broken))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn http_config(url: String, token_env: Option<&str>, since: Option<&str>) -> HttpConnectorConfig {
    HttpConnectorConfig {
        url,
        token_env: token_env.map(String::from),
        since_param: since.map(String::from),
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn http_connector_fetches_feed_with_bearer_token() {
    std::env::set_var("PIDX_TEST_FEED_TOKEN", "feed-token");
    let (base, state) = serve_feed().await;

    let connector = HttpConnector::new(
        "http:mcp-servers".into(),
        http_config(format!("{}/servers", base), Some("PIDX_TEST_FEED_TOKEN"), None),
    );
    let result = connector.run(None).await.unwrap();

    assert!(result.complete);
    assert_eq!(result.items.len(), 2);
    assert_eq!(result.source_errors.len(), 1);
    assert_eq!(result.items[1].downloads, Some(json!("3,400")));
    assert_eq!(state.queries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn http_connector_requests_incremental_listing_after_a_success() {
    std::env::set_var("PIDX_TEST_FEED_TOKEN_2", "feed-token");
    let (base, state) = serve_feed().await;

    let connector = HttpConnector::new(
        "http:mcp-servers".into(),
        http_config(
            format!("{}/servers", base),
            Some("PIDX_TEST_FEED_TOKEN_2"),
            Some("updated_since"),
        ),
    );
    let previous = PreviousState {
        last_success_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        items: 2,
    };
    let result = connector.run(Some(&previous)).await.unwrap();

    assert!(!result.complete);
    let queries = state.queries.lock().unwrap();
    assert_eq!(
        queries[0].get("updated_since").map(String::as_str),
        Some("2026-03-01T00:00:00+00:00")
    );
}

#[tokio::test]
async fn http_errors_make_connector_unavailable() {
    let (base, _state) = serve_feed().await;

    // No token configured: the feed answers 401.
    let unauthorized = HttpConnector::new(
        "http:test".into(),
        http_config(format!("{}/servers", base), None, None),
    );
    let err = unauthorized.run(None).await.unwrap_err();
    assert!(err.to_string().contains("401"));

    let failing = HttpConnector::new(
        "http:test".into(),
        http_config(format!("{}/broken", base), None, None),
    );
    let err = failing.run(None).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Unavailable(ref m) if m.contains("500")));

    // Nothing listens on port 9 locally.
    let unreachable = HttpConnector::new(
        "http:test".into(),
        http_config("http://127.0.0.1:9/servers".into(), None, None),
    );
    assert!(unreachable.run(None).await.is_err());
}
