use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use taskbridge_api::app::{build_app, services};
use taskbridge_infra::jobs::{handler_fn, HandlerError, HandlerRegistry, WorkerPool, WorkerPoolHandle, PROCESS_TASK};
use taskbridge_infra::{BridgeConfig, Broker, WorkerConfig};
use taskbridge_queue::{InMemoryJobQueue, InMemoryResultStore};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _workers: Option<WorkerPoolHandle>,
}

impl TestServer {
    async fn spawn(broker: Broker, bridge: BridgeConfig, workers: Option<WorkerPoolHandle>) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(&broker, bridge);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _workers: workers,
        }
    }

    /// In-memory broker with the default handlers running in-process.
    async fn with_default_workers(bridge: BridgeConfig) -> Self {
        let broker = Broker::in_memory(&Default::default());
        let workers = services::spawn_workers(&broker, fast_worker_config(), "test");
        Self::spawn(broker, bridge, Some(workers)).await
    }

    async fn post_process(&self, body: Value) -> (StatusCode, Value) {
        let res = reqwest::Client::new()
            .post(format!("{}/process", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_concurrency(2)
        .with_revoke_check_interval(Duration::from_millis(50))
        .with_claim_retry_interval(Duration::from_millis(50))
}

fn fast_bridge(timeout: Duration) -> BridgeConfig {
    BridgeConfig::default()
        .with_task_timeout(timeout)
        .with_check_interval(Duration::from_millis(50))
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::with_default_workers(BridgeConfig::default()).await;

    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn zero_delay_completes() {
    let server = TestServer::with_default_workers(fast_bridge(Duration::from_secs(10))).await;

    let (status, body) = server.post_process(json!({"delay": 0})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"], "request processed successfully");
    assert!(body["time"].as_f64().unwrap() < 1.0);
}

#[tokio::test]
async fn missing_delay_defaults_to_zero() {
    let server = TestServer::with_default_workers(fast_bridge(Duration::from_secs(10))).await;

    let (status, body) = server.post_process(json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn delay_is_reflected_in_time() {
    let server = TestServer::with_default_workers(fast_bridge(Duration::from_secs(10))).await;

    let (status, body) = server.post_process(json!({"delay": 1})).await;

    assert_eq!(status, StatusCode::OK);
    let time = body["time"].as_f64().unwrap();
    assert!(time >= 1.0, "time was {time}");
    assert!(time < 2.0, "time was {time}");
}

#[tokio::test]
async fn slow_job_returns_pending() {
    let server = TestServer::with_default_workers(fast_bridge(Duration::from_secs(1))).await;

    let (status, body) = server.post_process(json!({"delay": 3})).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(
        body["message"],
        "We cannot process your request yet, please try again later"
    );
    let time = body["time"].as_f64().unwrap();
    assert!(time >= 1.0 && time < 2.0, "time was {time}");
}

#[tokio::test]
async fn negative_delay_is_a_validation_error() {
    let server = TestServer::with_default_workers(BridgeConfig::default()).await;

    let (status, body) = server.post_process(json!({"delay": -5})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let server = TestServer::with_default_workers(BridgeConfig::default()).await;

    let (status, body) = server.post_process(json!({"delay": "soon"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");
}

#[tokio::test]
async fn handler_failure_is_reported_with_job_id() {
    let broker = Broker::in_memory(&Default::default());
    let workers = WorkerPool::new(
        Arc::clone(&broker.queue),
        Arc::clone(&broker.results),
        || {
            HandlerRegistry::new().with(
                PROCESS_TASK,
                handler_fn(|_, _| async { Err(HandlerError::failed("disk full")) }),
            )
        },
        fast_worker_config(),
    )
    .spawn();
    let server = TestServer::spawn(broker, fast_bridge(Duration::from_secs(10)), Some(workers)).await;

    let (status, body) = server.post_process(json!({"delay": 0})).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "disk full");
    assert!(body["job_id"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn broker_down_is_an_internal_error() {
    let queue = Arc::new(InMemoryJobQueue::new());
    queue.set_available(false);
    let results = Arc::new(InMemoryResultStore::new());
    let broker = Broker::new(queue, results.clone());
    let server = TestServer::spawn(broker, fast_bridge(Duration::from_secs(10)), None).await;

    let (status, body) = server.post_process(json!({"delay": 0})).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Internal server error");
    assert!(body["error"].as_str().unwrap().contains("broker unavailable"));
    assert!(body.get("job_id").is_none());
    assert_eq!(results.len().await, 0);
}
