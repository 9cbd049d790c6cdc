//! HTTP surface tests
//!
//! Drives the axum router in-process over the fake control plane and checks
//! the status-code contract of the administrative API.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::TestPlane;
use std::sync::Arc;
use tower::ServiceExt;
use wg_console::http::{router, AppState};
use wg_console::telemetry::ObserverHub;

const TOKEN: &str = "integration-secret";

fn app(plane: &TestPlane) -> Router {
    router(AppState {
        registry: plane.registry.clone(),
        manager: plane.manager.clone(),
        reconciler: plane.reconciler.clone(),
        kernel: plane.kernel.clone(),
        hub: Arc::new(ObserverHub::new()),
        settings: Arc::new(plane.settings.clone()),
    })
}

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let plane = TestPlane::new();
    let response = app(&plane)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let plane = TestPlane::new();
    let response = app(&plane)
        .oneshot(Request::get("/api/users").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let plane = TestPlane::new();
    let response = app(&plane)
        .oneshot(
            Request::get("/api/users")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_then_list() {
    let plane = TestPlane::new();

    let response = app(&plane)
        .oneshot(
            authed(Request::post("/api/users"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"username":"Alice","client_os":"android","acl_profile":"internet-only"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = body_json(response).await;
    assert_eq!(created["user"]["handle"], "alice");
    assert_eq!(created["user"]["acl_profile"], "internet-only");
    assert!(created["client_config"]
        .as_str()
        .unwrap()
        .contains("Address = 10.50.0.3/32"));
    // The sealed private key never leaves through the API.
    assert!(created["user"].get("private_key").is_none());

    let response = app(&plane)
        .oneshot(authed(Request::get("/api/users")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["users"].as_array().unwrap().len(), 1);
    assert_eq!(listed["users"][0]["connected"], false);
}

#[tokio::test]
async fn test_validation_conflict_and_not_found_codes() {
    let plane = TestPlane::new();
    let app = app(&plane);

    // Bad handle -> 400.
    let response = app
        .clone()
        .oneshot(
            authed(Request::post("/api/users"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"username":"x"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // First create succeeds, duplicate -> 409.
    for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
        let response = app
            .clone()
            .oneshot(
                authed(Request::post("/api/users"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username":"alice"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), expected);
    }

    // Unknown peer -> 404.
    let response = app
        .clone()
        .oneshot(
            authed(Request::delete("/api/users/ghost"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_toggle_rotate_config_and_sessions_routes() {
    let plane = TestPlane::new();
    let app = app(&plane);

    let response = app
        .clone()
        .oneshot(
            authed(Request::post("/api/users"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"username":"bob","client_os":"linux"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            authed(Request::patch("/api/users/bob/toggle"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "disabled");

    let response = app
        .clone()
        .oneshot(
            authed(Request::post("/api/users/bob/rotate"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            authed(Request::get("/api/users/bob/config"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let config = body_json(response).await;
    assert!(config["client_config"]
        .as_str()
        .unwrap()
        .contains("[Interface]"));

    let response = app
        .clone()
        .oneshot(
            authed(Request::get("/api/users/bob/sessions?limit=5"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_all_runs_the_reconciler() {
    let plane = TestPlane::new();
    plane.kernel.inject_peer("zombie-key", "10.50.0.99/32");

    let response = app(&plane)
        .oneshot(
            authed(Request::post("/api/users/sync_all"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = body_json(response).await;
    assert_eq!(report["zombies_purged"], 1);
    assert!(plane.kernel.kernel_keys().is_empty());
}
