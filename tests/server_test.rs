mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use base64::Engine as _;
use serde_json::{json, Value};

use common::*;
use tofu_broker::server::state::Credentials;
use tofu_broker::server::{build, AppState};

fn api_version() -> HeaderName {
    HeaderName::from_static("x-broker-api-version")
}

fn server(credentials: Credentials) -> TestServer {
    let storage = memory_storage();
    let broker = broker(&storage, service("1.6.2", &[], false), false, FakeTofu::new());
    let state = AppState::new(Arc::new(broker), credentials);
    TestServer::new(build(state)).unwrap()
}

fn version() -> HeaderValue {
    HeaderValue::from_static("2.14")
}

fn basic(user: &str, pass: &str) -> HeaderValue {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    HeaderValue::from_str(&format!("Basic {token}")).unwrap()
}

async fn wait_for_operation(server: &TestServer, path: &str) -> Value {
    for _ in 0..500 {
        let body: Value = server.get(path).add_header(api_version(), version()).await.json();
        if body["state"] != "in progress" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{path} did not finish");
}

#[tokio::test]
async fn test_catalog() {
    let server = server(Credentials::default());
    let resp = server.get("/v2/catalog").add_header(api_version(), version()).await;
    resp.assert_status_ok();

    let body: Value = resp.json();
    let svc = &body["services"][0];
    assert_eq!(svc["id"], SERVICE_ID);
    assert_eq!(svc["name"], "csb-test-db");
    let plans: Vec<&str> = svc["plans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(plans, vec!["small", "subsume"]);
}

#[tokio::test]
async fn test_api_version_header_is_required() {
    let server = server(Credentials::default());

    let resp = server.get("/v2/catalog").await;
    resp.assert_status(StatusCode::PRECONDITION_FAILED);
    let body: Value = resp.json();
    assert!(body["description"].as_str().unwrap().contains("2.13"));

    let resp = server
        .get("/v2/catalog")
        .add_header(api_version(), HeaderValue::from_static("2.12"))
        .await;
    resp.assert_status(StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_basic_auth() {
    let server = server(Credentials {
        username: "broker".into(),
        password: "secret".into(),
    });

    let resp = server.get("/v2/catalog").add_header(api_version(), version()).await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    let resp = server
        .get("/v2/catalog")
        .add_header(api_version(), version())
        .add_header(header::AUTHORIZATION, basic("broker", "wrong"))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    let resp = server
        .get("/v2/catalog")
        .add_header(api_version(), version())
        .add_header(header::AUTHORIZATION, basic("broker", "secret"))
        .await;
    resp.assert_status_ok();

    // Liveness stays open; state import does not.
    server.get("/").await.assert_status_ok();
    server
        .patch("/import_state/i1")
        .bytes("{}".into())
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_instance_and_binding_over_http() {
    let server = server(Credentials::default());

    let resp = server
        .put("/v2/service_instances/i1")
        .add_query_param("accepts_incomplete", "true")
        .add_header(api_version(), version())
        .json(&json!({
            "service_id": SERVICE_ID,
            "plan_id": PLAN_ID,
            "organization_guid": "org-1",
            "space_guid": "space-1",
            "parameters": {"name": "orders"},
        }))
        .await;
    resp.assert_status(StatusCode::ACCEPTED);
    resp.assert_json(&json!({}));

    let op = wait_for_operation(&server, "/v2/service_instances/i1/last_operation").await;
    assert_eq!(op["state"], "succeeded");

    let resp = server
        .put("/v2/service_instances/i1/service_bindings/b1")
        .add_header(api_version(), version())
        .json(&json!({"service_id": SERVICE_ID, "plan_id": PLAN_ID, "app_guid": "app-1"}))
        .await;
    resp.assert_status(StatusCode::CREATED);
    let body: Value = resp.json();
    assert_eq!(body["credentials"]["username"], "admin");

    let resp = server
        .delete("/v2/service_instances/i1/service_bindings/b1")
        .add_query_param("service_id", SERVICE_ID)
        .add_query_param("plan_id", PLAN_ID)
        .add_header(api_version(), version())
        .await;
    resp.assert_status_ok();
    resp.assert_json(&json!({}));

    let resp = server
        .delete("/v2/service_instances/i1")
        .add_query_param("accepts_incomplete", "true")
        .add_query_param("service_id", SERVICE_ID)
        .add_query_param("plan_id", PLAN_ID)
        .add_header(api_version(), version())
        .await;
    resp.assert_status(StatusCode::ACCEPTED);
    resp.assert_json(&json!({}));

    let resp = server
        .get("/v2/service_instances/i1/last_operation")
        .add_header(api_version(), version())
        .await;
    let status = resp.status_code();
    if status == StatusCode::OK {
        let body: Value = resp.json();
        assert_ne!(body["state"], "failed");
    } else {
        assert_eq!(status, StatusCode::GONE);
    }
}

#[tokio::test]
async fn test_error_responses() {
    let server = server(Credentials::default());

    let resp = server
        .put("/v2/service_instances/i1")
        .add_query_param("accepts_incomplete", "true")
        .add_header(api_version(), version())
        .bytes("not json".into())
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let resp = server
        .put("/v2/service_instances/i1")
        .add_header(api_version(), version())
        .json(&json!({"service_id": SERVICE_ID, "plan_id": PLAN_ID}))
        .await;
    resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = resp.json();
    assert_eq!(body["error"], "AsyncRequired");

    let resp = server
        .get("/v2/service_instances/missing/last_operation")
        .add_header(api_version(), version())
        .await;
    resp.assert_status(StatusCode::GONE);
}

#[tokio::test]
async fn test_admin_routes() {
    let server = server(Credentials::default());

    server.get("/").await.assert_status_ok();

    let info: Value = server.get("/info").await.json();
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    assert!(info["uptime"].as_str().unwrap().ends_with('s'));

    let docs = server.get("/docs").await;
    docs.assert_status_ok();
    assert!(docs.text().contains("csb-test-db"));

    let examples: Value = server.get("/examples").await.json();
    assert!(examples.as_array().unwrap().is_empty());

    let resp = server.patch("/import_state/missing").bytes("{}".into()).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}
