//! Monitoring API handler tests, driven through the router with
//! `tower::ServiceExt::oneshot` against a memory-only store.

use std::collections::HashSet;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use drover_core::api::{ApiState, build_router};
use drover_core::broker::{Broker, EVENT_DEPTH};
use drover_core::router::Router;
use drover_store::fallback::FallbackStore;
use drover_store::models::{NewLogEntry, Task};

const API_KEY: &str = "supersecret123";

struct ApiHarness {
    state: ApiState,
    cancel: CancellationToken,
}

impl ApiHarness {
    async fn start() -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_DEPTH);
        let router = Router::bind("127.0.0.1:0", event_tx)
            .await
            .expect("failed to bind test router");

        let store = FallbackStore::in_memory();
        let api_keys = HashSet::from([API_KEY.to_owned()]);
        let (broker, handle) = Broker::new(router.handle(), event_rx, store.clone(), api_keys);

        let cancel = CancellationToken::new();
        tokio::spawn(router.run(cancel.clone()));
        tokio::spawn(broker.run(cancel.clone()));

        Self {
            state: ApiState {
                store,
                broker: handle,
            },
            cancel,
        }
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = build_router(self.state.clone())
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("bad request builder"),
            )
            .await
            .expect("request failed");
        read_json(response).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = build_router(self.state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("bad request builder"),
            )
            .await
            .expect("request failed");
        read_json(response).await
    }
}

impl Drop for ApiHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not JSON")
    };
    (status, value)
}

#[tokio::test]
async fn empty_listings() {
    let h = ApiHarness::start().await;

    let (status, body) = h.get("/api/clients").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = h.get("/api/tasks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn status_reports_memory_backend() {
    let h = ApiHarness::start().await;
    let (status, body) = h.get("/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["degraded"], true);
    assert_eq!(body["shed_log_writes"], 0);
}

#[tokio::test]
async fn send_to_unknown_client_is_404() {
    let h = ApiHarness::start().await;
    let (status, body) = h
        .post(
            "/api/send",
            json!({"client_id": "nobody", "payload": "ls"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().expect("error field").contains("nobody"));
}

#[tokio::test]
async fn send_rejects_empty_fields() {
    let h = ApiHarness::start().await;

    let (status, _) = h
        .post("/api/send", json!({"client_id": "", "payload": "ls"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .post("/api/send", json!({"client_id": "c1", "payload": ""}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tasks_listing_reflects_store() {
    let h = ApiHarness::start().await;
    let task = Task::new("agent-01", "shell", "ls -la");
    h.state.store.insert_task(task.clone());
    h.state.store.flush().await;

    let (status, body) = h.get("/api/tasks").await;
    assert_eq!(status, StatusCode::OK);
    let listed = body.as_array().expect("array body");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], json!(task.id));
    assert_eq!(listed[0]["status"], "queued");
    assert_eq!(listed[0]["target"], "agent-01");
}

#[tokio::test]
async fn tasks_listing_honors_limit() {
    let h = ApiHarness::start().await;
    for i in 0..5 {
        h.state
            .store
            .insert_task(Task::new("agent-01", "shell", &format!("cmd {i}")));
    }
    h.state.store.flush().await;

    let (status, body) = h.get("/api/tasks?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().expect("array body").len(), 2);
}

#[tokio::test]
async fn negative_limit_is_an_empty_page_not_an_error() {
    let h = ApiHarness::start().await;
    h.state
        .store
        .insert_task(Task::new("agent-01", "shell", "ls"));
    h.state
        .store
        .append_log(NewLogEntry::event("agent-01", None, "authenticated"));
    h.state.store.flush().await;

    let (status, body) = h.get("/api/tasks?limit=-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = h.get("/api/client/agent-01/logs?limit=-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn client_logs_are_scoped_and_limited() {
    let h = ApiHarness::start().await;
    h.state
        .store
        .append_log(NewLogEntry::event("agent-01", None, "authenticated"));
    h.state
        .store
        .append_log(NewLogEntry::event("agent-02", None, "authenticated"));
    h.state.store.flush().await;

    let (status, body) = h.get("/api/client/agent-01/logs").await;
    assert_eq!(status, StatusCode::OK);
    let logs = body.as_array().expect("array body");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["client_id"], "agent-01");

    let (_, body) = h.get("/api/client/agent-03/logs").await;
    assert_eq!(body, json!([]));
}
