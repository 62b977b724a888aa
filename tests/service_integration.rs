//! Integration tests for the sync, pipeline and extraction sockets.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and plays both the UI and the extraction environment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use apply_pilot::config::{PipelineConfig, Profile};
use apply_pilot::error::LlmError;
use apply_pilot::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use apply_pilot::pipeline::{PipelineController, PipelineRouteState, pipeline_routes};
use apply_pilot::ports::{LlmAnalyzer, MessagePageExtractor};
use apply_pilot::store::{Database, LibSqlBackend};
use apply_pilot::sync::{LocalBus, MessageBus, Supervisor, SyncClient, sync_routes};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stub LLM provider for integration tests (no real API calls).
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: r#"{"score": 82, "cover_letter": "Dear Acme"}"#.to_string(),
        })
    }
}

struct TestServer {
    port: u16,
    sync: Arc<SyncClient>,
}

/// Start the full service on a random port.
async fn start_server(with_profile: bool) -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    if with_profile {
        Profile {
            keywords: vec!["rust engineer".into()],
            criteria: "Remote".into(),
            resume: "Backend work".into(),
            api_key: Some("sk-test".to_string().into()),
        }
        .save(db.as_ref())
        .await
        .unwrap();
    }

    let config = PipelineConfig {
        failure_delay: Duration::from_millis(5),
        extraction_timeout: Duration::from_secs(2),
        submission_timeout: Duration::from_secs(2),
        ..PipelineConfig::default()
    };

    let supervisor = Arc::new(Supervisor::load(Arc::clone(&db)).await.unwrap());
    let (bus, _task) = LocalBus::spawn(supervisor);
    let bus: Arc<dyn MessageBus> = Arc::new(bus);
    let sync = Arc::new(SyncClient::new(Arc::clone(&bus), config.request_timeout));

    let (extractor, link) = MessagePageExtractor::channel(&config);
    let controller = Arc::new(PipelineController::new(
        Arc::clone(&sync),
        Arc::new(extractor),
        Arc::new(LlmAnalyzer::with_provider(Arc::new(StubLlm))),
        Arc::clone(&db),
        &config,
    ));

    let app = sync_routes(bus).merge(pipeline_routes(PipelineRouteState {
        controller,
        settings: db,
        extraction: Arc::new(Mutex::new(link)),
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer { port, sync }
}

async fn connect(port: u16, path: &str) -> Ws {
    let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}{path}"))
        .await
        .expect("WS connect failed");
    // Let the server side subscribe before anything is published.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(txt) => return serde_json::from_str(&txt).expect("invalid JSON from server"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected Text frame, got {:?}", other),
        }
    }
}

/// Skip frames until one with `field == value` arrives.
async fn next_where(ws: &mut Ws, field: &str, value: &str) -> Value {
    loop {
        let json = next_json(ws).await;
        if json[field] == value {
            return json;
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn post(port: u16, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .send()
        .await
        .unwrap()
}

// ── Sync socket ──────────────────────────────────────────────────────

#[tokio::test]
async fn sync_ws_connect_receives_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut ws = connect(server.port, "/ws").await;

        let first = next_json(&mut ws).await;
        assert_eq!(first["frame"], "notification");
        assert_eq!(first["notification"]["type"], "STATE_CHANGED");
        assert_eq!(first["notification"]["state"]["is_processing"], false);

        let second = next_json(&mut ws).await;
        assert_eq!(second["notification"]["type"], "JOBS_CHANGED");
        assert_eq!(second["notification"]["counts"]["pending"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sync_ws_request_gets_correlated_response() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut ws = connect(server.port, "/ws").await;

        let request_id = "6f0c1f36-5d7b-4b53-9a51-7f1f3c0e2a10";
        send_json(
            &mut ws,
            json!({
                "request_id": request_id,
                "request": {
                    "type": "APPEND_JOBS",
                    "candidates": [
                        {"id": "A", "title": "Rust Engineer", "organization": "Acme", "source_url": "https://jobs.example/A"},
                        {"id": "B", "title": "Rust Engineer", "organization": "Initech", "source_url": "https://jobs.example/B"}
                    ]
                }
            }),
        )
        .await;

        let frame = next_where(&mut ws, "frame", "response").await;
        assert_eq!(frame["request_id"], request_id);
        assert_eq!(frame["response"]["type"], "appended");
        assert_eq!(frame["response"]["inserted"], 2);
        assert_eq!(frame["response"]["persisted"], true);

        let (jobs, _) = server.sync.jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sync_ws_rejects_unknown_request() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut ws = connect(server.port, "/ws").await;

        send_json(
            &mut ws,
            json!({
                "request_id": "6f0c1f36-5d7b-4b53-9a51-7f1f3c0e2a10",
                "request": {"type": "DELETE_EVERYTHING"}
            }),
        )
        .await;

        let frame = next_where(&mut ws, "frame", "invalid").await;
        assert!(!frame["reason"].as_str().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sync_ws_reports_rejected_transition() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut ws = connect(server.port, "/ws").await;

        send_json(
            &mut ws,
            json!({
                "request_id": "0b8e4c52-3a57-4d8e-8f0e-2f4d6a9c1b33",
                "request": {"type": "UPDATE_JOB", "job_id": "missing", "change": {"change": "approve"}}
            }),
        )
        .await;

        let frame = next_where(&mut ws, "frame", "response").await;
        assert_eq!(frame["response"]["type"], "rejected");
        assert_eq!(frame["response"]["error"]["kind"], "not_found");
    })
    .await
    .expect("test timed out");
}

// ── Full pipeline over sockets ───────────────────────────────────────

#[tokio::test]
async fn pipeline_discovers_reviews_and_submits() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut env = connect(server.port, "/ws/extraction").await;
        let mut ui = connect(server.port, "/ws/pipeline").await;

        let resp = post(server.port, "/api/pipeline/start").await;
        assert_eq!(resp.status(), 202);

        let discover = next_json(&mut env).await;
        assert_eq!(discover["type"], "DISCOVER");
        assert_eq!(discover["keywords"][0], "rust engineer");
        send_json(
            &mut env,
            json!({
                "type": "LISTINGS_FOUND",
                "candidates": [{"id": "A", "title": "Rust Engineer", "organization": "Acme", "source_url": "https://jobs.example/A"}]
            }),
        )
        .await;

        let extract = next_json(&mut env).await;
        assert_eq!(extract["type"], "EXTRACT_DESCRIPTION");
        assert_eq!(extract["job_id"], "A");
        send_json(
            &mut env,
            json!({"type": "DESCRIPTION_FOUND", "job_id": "A", "text": "Build services in Rust."}),
        )
        .await;

        let awaiting = next_where(&mut ui, "type", "awaiting_decision").await;
        assert_eq!(awaiting["job"]["id"], "A");
        assert_eq!(awaiting["job"]["status"], "reviewing");
        assert_eq!(awaiting["job"]["compatibility_score"], 82);

        let resp = post(server.port, "/api/pipeline/approve").await;
        assert_eq!(resp.status(), 202);

        let submit = next_json(&mut env).await;
        assert_eq!(submit["type"], "SUBMIT");
        assert_eq!(submit["content"], "Dear Acme");
        send_json(&mut env, json!({"type": "SUBMIT_RESULT", "job_id": "A", "success": true})).await;

        let applied = next_where(&mut ui, "type", "job_applied").await;
        assert_eq!(applied["job"]["status"], "applied");
        next_where(&mut ui, "type", "drained").await;

        let body: Value = reqwest::get(format!("http://127.0.0.1:{}/api/jobs/A", server.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["job"]["status"], "applied");
        assert!(body["job"]["submitted_at"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn lost_environment_stalls_until_reconnect() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut env = connect(server.port, "/ws/extraction").await;
        let mut ui = connect(server.port, "/ws/pipeline").await;

        post(server.port, "/api/pipeline/start").await;
        next_where(&mut env, "type", "DISCOVER").await;
        send_json(
            &mut env,
            json!({
                "type": "LISTINGS_FOUND",
                "candidates": [
                    {"id": "A", "title": "Rust Engineer", "organization": "Acme", "source_url": "https://jobs.example/A"},
                    {"id": "B", "title": "Rust Engineer", "organization": "Initech", "source_url": "https://jobs.example/B"}
                ]
            }),
        )
        .await;
        let extract = next_where(&mut env, "type", "EXTRACT_DESCRIPTION").await;
        assert_eq!(extract["job_id"], "A");

        env.close(None).await.unwrap();
        drop(env);

        let stalled = next_where(&mut ui, "type", "stalled").await;
        assert_eq!(stalled["job"]["id"], "A");
        let state = server.sync.get_state().await.unwrap();
        assert!(state.is_processing);
        assert_eq!(state.current_job_id.as_deref(), Some("A"));
        let (jobs, counts) = server.sync.jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(counts.pending, 2);

        // A new environment picks the run back up with the same job.
        let mut env = connect(server.port, "/ws/extraction").await;
        let extract = next_where(&mut env, "type", "EXTRACT_DESCRIPTION").await;
        assert_eq!(extract["job_id"], "A");
        send_json(
            &mut env,
            json!({"type": "DESCRIPTION_FOUND", "job_id": "A", "text": "Build services in Rust."}),
        )
        .await;

        let awaiting = next_where(&mut ui, "type", "awaiting_decision").await;
        assert_eq!(awaiting["job"]["id"], "A");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pipeline_ws_accepts_commands() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let mut ui = connect(server.port, "/ws/pipeline").await;

        send_json(&mut ui, json!({"command": "decline"})).await;
        let failed = next_where(&mut ui, "type", "failed").await;
        assert_eq!(failed["command"], "decline");

        send_json(&mut ui, json!({"command": "launch"})).await;
        let failed = next_where(&mut ui, "type", "failed").await;
        assert_eq!(failed["command"], "unknown");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_without_profile_reports_failure() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let mut ui = connect(server.port, "/ws/pipeline").await;

        post(server.port, "/api/pipeline/start").await;

        let failed = next_where(&mut ui, "type", "failed").await;
        assert_eq!(failed["command"], "start");
        assert!(failed["reason"].as_str().unwrap().contains("profile"));
        assert!(!server.sync.get_state().await.unwrap().is_processing);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_extraction_environment_is_refused() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let _first = connect(server.port, "/ws/extraction").await;

        let second = connect_async(format!("ws://127.0.0.1:{}/ws/extraction", server.port)).await;
        match second {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status(), 409);
            }
            other => panic!("expected HTTP 409, got {:?}", other.map(|_| ())),
        }
    })
    .await
    .expect("test timed out");
}

// ── REST ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "apply-pilot");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_profile_roundtrip_redacts_credential() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let url = format!("http://127.0.0.1:{}/api/profile", server.port);

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::Client::new()
            .put(&url)
            .json(&json!({
                "keywords": ["platform engineer"],
                "criteria": "Remote",
                "resume": "Ops and Rust",
                "api_key": "sk-secret"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["keywords"][0], "platform engineer");
        assert_eq!(body["has_credential"], true);
        assert!(body.get("api_key").is_none());
        assert!(!body.to_string().contains("sk-secret"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_job_routes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        server
            .sync
            .append_jobs(vec![apply_pilot::jobs::Candidate::new(
                "A",
                "Rust Engineer",
                "Acme",
                "https://jobs.example/A",
            )])
            .await
            .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/jobs/missing", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let body: Value = post(server.port, "/api/jobs/A/star").await.json().await.unwrap();
        assert_eq!(body["job"]["starred"], true);

        let body: Value = reqwest::get(format!("http://127.0.0.1:{}/api/jobs", server.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["counts"]["pending"], 1);

        let body: Value = post(server.port, "/api/clear").await.json().await.unwrap();
        assert_eq!(body["removed"], 1);
        assert!(server.sync.jobs().await.unwrap().0.is_empty());
    })
    .await
    .expect("test timed out");
}
