//! Router-level tests: requests go through the full middleware stack.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use changeflow::config::{CorsConfig, EngineConfig, LogFormat, ServerConfig, Settings, ValidationRules};
use changeflow::routes::create_router;
use changeflow::state::AppState;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn settings(dir: &TempDir) -> Settings {
    let path = dir.path().join("forms.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS option_items (id TEXT PRIMARY KEY, value TEXT NOT NULL);
         INSERT OR IGNORE INTO option_items (id, value) VALUES ('OPT_TOKYO', 'Tokyo'), ('OPT_OSAKA', 'Osaka');",
    )
    .unwrap();

    Settings {
        server: ServerConfig::default(),
        cors: CorsConfig::default(),
        engine: EngineConfig {
            database_path: path,
            ..EngineConfig::default()
        },
        rules: ValidationRules::default(),
        log_format: LogFormat::Compact,
    }
}

async fn call(dir: &TempDir, request: Request<Body>) -> (StatusCode, Value) {
    let settings = settings(dir);
    let app = create_router(Arc::new(AppState::new(settings.clone())), &settings);

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn validate_returns_report() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(
        &dir,
        post(
            "/api/validate",
            json!({"changeset": {"option_items": {"update": [{"id": "OPT_TOKYO", "value": "Wuhan"}]}}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["summary"]["applied_operations"], 1);
    assert_eq!(body["summary"]["stages"].as_array().unwrap().last().unwrap(), "Cleaned");
}

#[tokio::test]
async fn missing_database_is_a_setup_report() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(
        &dir,
        post(
            "/api/validate",
            json!({"changeset": {}, "databasePath": "missing.sqlite"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["errors"][0]["category"], "SetupError");
}

#[tokio::test]
async fn database_outside_the_root_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let foreign = elsewhere.path().join("other.sqlite");
    Connection::open(&foreign)
        .unwrap()
        .execute_batch("CREATE TABLE secrets (id TEXT PRIMARY KEY);")
        .unwrap();

    for requested in [foreign.to_str().unwrap(), "../../etc/passwd", "/etc/passwd"] {
        let (status, body) = call(
            &dir,
            post("/api/validate", json!({"changeset": {}, "databasePath": requested})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", requested);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    let uri = format!("/api/schema?databasePath={}", foreign.display());
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _) = call(&dir, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_counts_cases() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(
        &dir,
        post(
            "/api/validate/batch",
            json!({"cases": [
                {"name": "rename", "changeset": {"option_items": {"update": [{"id": "OPT_OSAKA", "value": "Nara"}]}}},
                {"changeset": {"option_items": {"update": [{"value": "no id"}]}}}
            ]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["passed"], 1);
    assert_eq!(body["results"][1]["name"], "case-2");
}

#[tokio::test]
async fn empty_batch_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(&dir, post("/api/validate/batch", json!({"cases": []}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn schema_lists_tables() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::builder().uri("/api/schema").body(Body::empty()).unwrap();
    let (status, body) = call(&dir, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tableCount"], 1);
    assert_eq!(body["data"]["schema"]["tables"][0]["name"], "option_items");
}

#[tokio::test]
async fn health_reports_database() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = call(&dir, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"]["available"], true);
}
