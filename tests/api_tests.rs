//! HTTP surface integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::test_app;

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_endpoint() {
    let (app, _h) = test_app().await;

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "sandman-orchestrator");
}

#[tokio::test]
async fn create_session_returns_full_connection_details() {
    let (app, _h) = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1", "ttl_minutes": 5, "mig_profile": "3g.20gb"})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(body["session_id"].is_string());
    assert!(body["container_id"].is_string());
    assert_eq!(body["ssh_user"], "u1");
    assert_eq!(body["ssh_host"], "localhost");
    assert_eq!(body["ssh_port"], 10000);
    assert!(body["ssh_private_key"]
        .as_str()
        .unwrap()
        .contains("BEGIN RSA PRIVATE KEY"));
    assert!(body["gpu_uuid"].as_str().unwrap().starts_with("MIG-"));
    // RFC 3339 timestamps.
    assert!(body["created_at"].as_str().unwrap().contains('T'));
    assert!(body["expires_at"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn create_session_validates_user_id() {
    let (app, h) = test_app().await;

    let (status, body) = send(&app, Method::POST, "/sessions", Some(json!({"user_id": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("user_id"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "has space"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No side effects.
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.ports.held_count(), 0);
}

#[tokio::test]
async fn duplicate_create_is_a_500_with_a_descriptive_error() {
    let (app, h) = test_app().await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("already exists"));

    // Exactly one session persists, holding one of everything.
    assert_eq!(h.repo.list().await.unwrap().len(), 1);
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.gpus.snapshot().iter().filter(|s| s.in_use).count(), 1);
    assert_eq!(h.ports.held_count(), 1);
}

#[tokio::test]
async fn exhaustion_is_a_500_and_changes_nothing() {
    let (app, h) = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1", "mig_profile": "7g.80gb"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("no free MIG instance"));

    let (_, sessions) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(sessions, json!([]));
    assert_eq!(h.gpus.snapshot_free().len(), 3);
}

#[tokio::test]
async fn uuid_targeting_through_the_api() {
    let (app, _h) = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u3", "mig_instance_uuid": "MIG-cccc3333"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["gpu_uuid"], "MIG-cccc3333");

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u4", "mig_instance_uuid": "MIG-cccc3333"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("already in use"));
}

#[tokio::test]
async fn list_sessions_is_always_an_array() {
    let (app, _h) = test_app().await;

    // The empty listing is the literal empty array, never null.
    let (status, body) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1"})),
    )
    .await;

    let (_, body) = send(&app, Method::GET, "/sessions", None).await;
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["user_id"], "u1");
    // The record never exposes a private key.
    assert!(sessions[0].get("ssh_private_key").is_none());
}

#[tokio::test]
async fn get_and_delete_session_by_id() {
    let (app, _h) = test_app().await;

    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1"})),
    )
    .await;
    let id = created["session_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["user_id"], "u1");

    let (status, body) = send(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("deleted"));

    let (status, body) = send(&app, Method::GET, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    // Deleting again is a 404.
    let (status, _) = send(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_session_is_a_404() {
    let (app, _h) = test_app().await;
    let (status, body) = send(&app, Method::GET, "/sessions/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn bulk_delete_empties_the_listing() {
    let (app, h) = test_app().await;

    for (user, profile) in [("u1", "3g.20gb"), ("u2", "3g.20gb"), ("u3", "1g.5gb")] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/sessions",
            Some(json!({"user_id": user, "mig_profile": profile})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(&app, Method::DELETE, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());

    let (_, sessions) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(sessions, json!([]));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.gpus.snapshot_free().len(), 3);
}

#[tokio::test]
async fn gpu_endpoints_track_allocation() {
    let (app, _h) = test_app().await;

    let (status, body) = send(&app, Method::GET, "/gpus", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    assert_eq!(body["gpus"].as_array().unwrap().len(), 3);

    let (status, body) = send(&app, Method::GET, "/gpus/profiles", None).await;
    assert_eq!(status, StatusCode::OK);
    let profiles = body["profiles"].as_array().unwrap();
    assert!(profiles.iter().any(|p| p["name"] == "3g.20gb"));

    let (_, before) = send(&app, Method::GET, "/gpus/available", None).await;
    assert_eq!(before["count"], 3);

    send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1"})),
    )
    .await;

    let (_, after) = send(&app, Method::GET, "/gpus/available", None).await;
    assert_eq!(after["count"], 2);
    let available = after["available_instances"].as_array().unwrap();
    assert!(available.iter().all(|s| s["in_use"] == false));

    // The full listing shows the holder.
    let (_, gpus) = send(&app, Method::GET, "/gpus", None).await;
    let held: Vec<_> = gpus["gpus"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| s["in_use"] == true)
        .collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0]["held_by"], "u1");
}

#[tokio::test]
async fn session_stats_counts_expiry() {
    let (app, _h) = test_app().await;

    let (status, body) = send(&app, Method::GET, "/sessions/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_sessions"], 0);

    send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1", "ttl_minutes": 120})),
    )
    .await;

    let (_, body) = send(&app, Method::GET, "/sessions/stats", None).await;
    assert_eq!(body["total_sessions"], 1);
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["expired_sessions"], 0);
}

#[tokio::test]
async fn ttl_zero_falls_back_to_the_default() {
    let (app, _h) = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({"user_id": "u1", "ttl_minutes": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let created: chrono::DateTime<chrono::Utc> =
        body["created_at"].as_str().unwrap().parse().unwrap();
    let expires: chrono::DateTime<chrono::Utc> =
        body["expires_at"].as_str().unwrap().parse().unwrap();
    assert_eq!((expires - created).num_minutes(), 60);
}

#[tokio::test]
async fn cors_preflight_is_permissive() {
    let (app, _h) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::OPTIONS)
                .header(header::ORIGIN, "https://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_MAX_AGE)
            .and_then(|v| v.to_str().ok()),
        Some("86400")
    );
}
