#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::FutureExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::Instant;
use tower::util::ServiceExt;

use agent_hub::agents::embedded::{EmbeddedAgent, EmbeddedConfig};
use agent_hub::agents::fake::FakeAgent;
use agent_hub::agents::Streamer;
use agent_hub::cache::AgentFactory;
use agent_hub::router::{build_router, AgentInfo, AppState, AuthConfig, HubConfig};
use agent_hub_storage::{Store, Thread};

pub const CLIENT_A: &str = "client-a";
pub const CLIENT_B: &str = "client-b";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    _db_dir: Option<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        TestAppBuilder::default().build().await
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder::default()
    }
}

pub struct TestAppBuilder {
    db_path: Option<PathBuf>,
    factory: AgentFactory,
    auth: AuthConfig,
    config: HubConfig,
}

impl Default for TestAppBuilder {
    fn default() -> Self {
        Self {
            db_path: None,
            factory: fake_factory(3, 10),
            auth: AuthConfig::disabled(),
            config: HubConfig {
                agents: vec![
                    AgentInfo {
                        id: "fake".to_string(),
                        name: "Fake".to_string(),
                        status: "available".to_string(),
                    },
                    AgentInfo {
                        id: "embedded".to_string(),
                        name: "Embedded".to_string(),
                        status: "available".to_string(),
                    },
                ],
                allowed_agents: vec!["fake".to_string(), "embedded".to_string()],
                ..HubConfig::default()
            },
        }
    }
}

impl TestAppBuilder {
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    pub fn factory(mut self, factory: AgentFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth = AuthConfig::with_token(token.to_string());
        self
    }

    pub fn permission_timeout(mut self, timeout: Duration) -> Self {
        self.config.permission_timeout = timeout;
        self
    }

    pub async fn build(self) -> TestApp {
        let (store, db_dir) = match self.db_path {
            Some(path) => (Store::open(&path).await.expect("open store"), None),
            None => {
                let dir = tempfile::tempdir().expect("create temp db dir");
                let store = Store::open(&dir.path().join("agent-hub.db"))
                    .await
                    .expect("open store");
                (store, Some(dir))
            }
        };

        let state = AppState::new(self.auth, store, self.factory, self.config);
        let app = build_router(state.clone());
        TestApp {
            app,
            state,
            _db_dir: db_dir,
        }
    }
}

pub fn fake_factory(chunk_size: usize, delay_ms: u64) -> AgentFactory {
    Arc::new(move |_thread: Thread| {
        let agent = FakeAgent::with_config(chunk_size, Duration::from_millis(delay_ms));
        async move { Ok(Arc::new(agent) as Arc<dyn Streamer>) }.boxed()
    })
}

pub fn embedded_factory(fail_first_prompt: bool) -> AgentFactory {
    Arc::new(move |thread: Thread| {
        async move {
            let agent = EmbeddedAgent::new(EmbeddedConfig {
                cwd: thread.cwd.clone(),
                fail_first_prompt,
                ..Default::default()
            });
            Ok(Arc::new(agent) as Arc<dyn Streamer>)
        }
        .boxed()
    })
}

pub async fn send_request(
    app: &Router,
    method: Method,
    path: &str,
    client_id: Option<&str>,
    body: Option<Value>,
) -> axum::response::Response {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    if let Some(client_id) = client_id {
        builder = builder.header("x-client-id", client_id);
    }
    let request = builder
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("build request");
    app.clone().oneshot(request).await.expect("send request")
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    client_id: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = send_request(app, method, path, client_id, body).await;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_status(
    app: &Router,
    method: Method,
    path: &str,
    client_id: Option<&str>,
    body: Option<Value>,
) -> StatusCode {
    let (status, _) = send_json(app, method, path, client_id, body).await;
    status
}

pub async fn create_thread(app: &Router, client_id: &str, agent: &str, cwd: &str) -> String {
    let (status, payload) = send_json(
        app,
        Method::POST,
        "/v1/threads",
        Some(client_id),
        Some(json!({ "agent": agent, "cwd": cwd })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create thread: {payload}");
    payload["threadId"]
        .as_str()
        .expect("threadId in response")
        .to_string()
}

/// Posts a streaming turn and collects the full SSE body once the turn ends.
pub async fn post_turn(
    app: &Router,
    client_id: &str,
    thread_id: &str,
    input: &str,
) -> (StatusCode, String) {
    let response = send_request(
        app,
        Method::POST,
        &format!("/v1/threads/{thread_id}/turns"),
        Some(client_id),
        Some(json!({ "input": input, "stream": true })),
    )
    .await;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect sse body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// Parses an SSE body into `(event, data)` pairs.
pub fn parse_sse_frames(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut event_type = String::new();
            let mut data = Value::Null;
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_type = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = serde_json::from_str(rest.trim()).unwrap_or(Value::Null);
                }
            }
            (event_type, data)
        })
        .collect()
}

pub fn delta_concat(frames: &[(String, Value)]) -> String {
    frames
        .iter()
        .filter(|(event, _)| event == "message_delta")
        .filter_map(|(_, data)| data["delta"].as_str().map(str::to_string))
        .collect()
}

/// Polls the thread history (events and internal turns included) until the
/// predicate holds.
pub async fn poll_history_until<F>(
    app: &Router,
    client_id: &str,
    thread_id: &str,
    timeout: Duration,
    mut stop: F,
) -> Value
where
    F: FnMut(&Value) -> bool,
{
    let deadline = Instant::now() + timeout;
    let path = format!("/v1/threads/{thread_id}/history?includeEvents=true&includeInternal=true");
    loop {
        let (status, payload) = send_json(app, Method::GET, &path, Some(client_id), None).await;
        assert_eq!(status, StatusCode::OK, "poll history: {payload}");
        if stop(&payload) {
            return payload;
        }
        assert!(
            Instant::now() < deadline,
            "history condition not reached before timeout: {payload}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn find_turn_with_status<'a>(history: &'a Value, status: &str) -> Option<&'a Value> {
    history["turns"]
        .as_array()?
        .iter()
        .find(|turn| turn["status"] == status)
}

pub fn find_permission_id(history: &Value) -> Option<String> {
    for turn in history["turns"].as_array()? {
        let Some(events) = turn["events"].as_array() else {
            continue;
        };
        for event in events {
            if event["type"] == "permission_required" {
                if let Some(id) = event["data"]["permissionId"].as_str() {
                    return Some(id.to_string());
                }
            }
        }
    }
    None
}
