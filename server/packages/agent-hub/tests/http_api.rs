mod common;

use axum::http::{Method, StatusCode};
use common::*;
use serde_json::json;

#[tokio::test]
async fn healthz_is_open_and_reports_ok() {
    let harness = TestApp::new().await;
    let (status, payload) = send_json(&harness.app, Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["ok"], true);
}

#[tokio::test]
async fn v1_requires_the_client_id_header() {
    let harness = TestApp::new().await;
    let (status, payload) = send_json(&harness.app, Method::GET, "/v1/threads", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "INVALID_ARGUMENT");
    assert_eq!(payload["error"]["details"]["header"], "X-Client-ID");
}

#[tokio::test]
async fn bearer_token_is_enforced_when_configured() {
    let harness = TestApp::builder().auth_token("sekrit").build().await;

    let (status, payload) =
        send_json(&harness.app, Method::GET, "/v1/agents", Some(CLIENT_A), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error"]["code"], "UNAUTHORIZED");

    let request = axum::http::Request::builder()
        .method(Method::GET)
        .uri("/v1/agents")
        .header("x-client-id", CLIENT_A)
        .header("authorization", "Bearer sekrit")
        .body(axum::body::Body::empty())
        .expect("build request");
    let response = tower::util::ServiceExt::oneshot(harness.app.clone(), request)
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::OK);

    // Health stays unauthenticated.
    let (status, _) = send_json(&harness.app, Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn agents_endpoint_lists_configured_agents() {
    let harness = TestApp::new().await;
    let (status, payload) =
        send_json(&harness.app, Method::GET, "/v1/agents", Some(CLIENT_A), None).await;
    assert_eq!(status, StatusCode::OK);
    let agents = payload["agents"].as_array().expect("agents array");
    assert!(agents
        .iter()
        .any(|agent| agent["id"] == "fake" && agent["status"] == "available"));
}

#[tokio::test]
async fn create_thread_validates_agent_cwd_and_options() {
    let harness = TestApp::new().await;

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/threads",
        Some(CLIENT_A),
        Some(json!({ "agent": "not-allowlisted", "cwd": "/tmp/proj" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["code"], "INVALID_ARGUMENT");
    assert_eq!(payload["error"]["details"]["field"], "agent");

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/threads",
        Some(CLIENT_A),
        Some(json!({ "agent": "fake", "cwd": "./relative" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["details"]["field"], "cwd");

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/threads",
        Some(CLIENT_A),
        Some(json!({ "agent": "fake", "cwd": "/tmp/proj", "agentOptions": ["bad"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["details"]["field"], "agentOptions");

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/threads",
        Some(CLIENT_A),
        Some(json!({ "agent": "fake", "cwd": "/tmp/proj" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let thread_id = payload["threadId"].as_str().expect("threadId").to_string();

    let (status, payload) = send_json(
        &harness.app,
        Method::GET,
        &format!("/v1/threads/{thread_id}"),
        Some(CLIENT_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["thread"]["agent"], "fake");
    assert_eq!(payload["thread"]["cwd"], "/tmp/proj");
    assert_eq!(payload["thread"]["agentOptions"], json!({}));
    assert_eq!(payload["thread"]["summary"], "");
}

#[tokio::test]
async fn cross_client_thread_access_is_indistinguishable_from_missing() {
    let harness = TestApp::new().await;
    let thread_id = create_thread(&harness.app, CLIENT_A, "fake", "/tmp/proj").await;

    let (owner_status, _) = send_json(
        &harness.app,
        Method::GET,
        &format!("/v1/threads/{thread_id}"),
        Some(CLIENT_A),
        None,
    )
    .await;
    assert_eq!(owner_status, StatusCode::OK);

    let (foreign_status, foreign_payload) = send_json(
        &harness.app,
        Method::GET,
        &format!("/v1/threads/{thread_id}"),
        Some(CLIENT_B),
        None,
    )
    .await;
    let (missing_status, missing_payload) = send_json(
        &harness.app,
        Method::GET,
        "/v1/threads/th_does_not_exist",
        Some(CLIENT_B),
        None,
    )
    .await;
    assert_eq!(foreign_status, StatusCode::NOT_FOUND);
    assert_eq!(missing_status, StatusCode::NOT_FOUND);
    assert_eq!(
        foreign_payload["error"]["code"],
        missing_payload["error"]["code"]
    );
    assert_eq!(
        foreign_payload["error"]["message"],
        missing_payload["error"]["message"]
    );

    let (status, payload) =
        send_json(&harness.app, Method::GET, "/v1/threads", Some(CLIENT_B), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["threads"].as_array().expect("threads").len(), 0);
}

#[tokio::test]
async fn unknown_routes_return_the_error_envelope() {
    let harness = TestApp::new().await;
    let (status, payload) = send_json(
        &harness.app,
        Method::GET,
        "/v1/does-not-exist",
        Some(CLIENT_A),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn permission_decisions_validate_outcome_and_ownership() {
    let harness = TestApp::new().await;

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/permissions/perm_unknown_1",
        Some(CLIENT_A),
        Some(json!({ "outcome": "maybe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["details"]["field"], "outcome");

    let (status, payload) = send_json(
        &harness.app,
        Method::POST,
        "/v1/permissions/perm_unknown_1",
        Some(CLIENT_A),
        Some(json!({ "outcome": "approved" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["error"]["code"], "NOT_FOUND");
}
