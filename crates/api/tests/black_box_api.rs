use std::sync::Arc;
use std::time::Duration;

use jobqueue_api::app::{build_app, services::InMemoryStack};
use jobqueue_infra::workers::{MockProvider, ReconcilerConfig, WorkerConfig};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::watch;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    /// Same router as prod over the in-memory stack; no worker lanes.
    async fn spawn() -> Self {
        Self::spawn_with(false).await
    }

    /// Also runs one lane with an instant, never-failing mock provider.
    async fn spawn_with_worker() -> Self {
        Self::spawn_with(true).await
    }

    async fn spawn_with(worker: bool) -> Self {
        let stack = InMemoryStack::new(Duration::from_secs(30));
        let (shutdown, shutdown_rx) = watch::channel(false);
        if worker {
            let provider = Arc::new(
                MockProvider::with_seed(11)
                    .with_latency(Duration::ZERO, Duration::ZERO)
                    .with_failure_rate(0.0),
            );
            let config = WorkerConfig {
                dequeue_timeout: Duration::from_millis(50),
                heartbeat_interval: Duration::from_millis(50),
                ..WorkerConfig::default()
            };
            stack.spawn_workers(provider, config, 1, ReconcilerConfig::default(), shutdown_rx);
        }

        let app = build_app(Arc::new(stack.services(Duration::from_secs(60))));
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
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

async fn create_job(
    client: &reqwest::Client,
    srv: &TestServer,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let res = client
        .post(srv.url("/v1/jobs"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn healthz_reports_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/healthz")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn create_applies_defaults_and_replays_by_idempotency_key() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = create_job(
        &client,
        &srv,
        json!({"tenant_id": "t1", "model": "gpt-mock", "priority": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["idempotent_replay"], false);
    assert_eq!(body["job"]["status"], "queued");
    assert_eq!(body["job"]["priority"], 3);
    assert_eq!(body["job"]["max_attempts"], 3);
    assert_eq!(body["job"]["attempt"], 0);
    assert_eq!(body["job"]["payload"], json!({}));

    // Header key, first payload wins.
    let first = client
        .post(srv.url("/v1/jobs"))
        .header("Idempotency-Key", "abc")
        .json(&json!({"tenant_id": "t1", "model": "m", "payload": {"n": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first: serde_json::Value = first.json().await.unwrap();

    let (status, replay) = create_job(
        &client,
        &srv,
        json!({"tenant_id": "t1", "model": "m", "payload": {"n": 2}, "idempotency_key": "abc"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["idempotent_replay"], true);
    assert_eq!(replay["job"]["id"], first["job"]["id"]);
    assert_eq!(replay["job"]["payload"], json!({"n": 1}));

    // Same key, other tenant: a new job.
    let (status, _) = create_job(
        &client,
        &srv,
        json!({"tenant_id": "t2", "model": "m", "idempotency_key": "abc"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/v1/jobs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_json");

    let (status, body) = create_job(&client, &srv, json!({"tenant_id": "t1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn get_and_list_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (_, a) = create_job(&client, &srv, json!({"tenant_id": "t1", "model": "m1"})).await;
    create_job(&client, &srv, json!({"tenant_id": "t2", "model": "m2"})).await;
    let id = a["job"]["id"].as_str().unwrap().to_string();

    let res = client.get(srv.url(&format!("/v1/jobs/{id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let snapshot: serde_json::Value = res.json().await.unwrap();
    assert_eq!(snapshot["job"]["id"], id.as_str());
    assert!(snapshot.get("latest_attempt").is_none());

    let res = client
        .get(srv.url("/v1/jobs?tenant=t1&status=queued"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["tenant_id"], "t1");

    let res = client.get(srv.url("/v1/jobs?limit=1")).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    for bad in ["/v1/jobs?limit=0", "/v1/jobs?limit=abc", "/v1/jobs?status=paused"] {
        let res = client.get(srv.url(bad)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{bad}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "validation_error");
    }
}

#[tokio::test]
async fn unknown_or_malformed_ids_are_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for path in [
        "/v1/jobs/0190a3b2-0000-7000-8000-000000000000",
        "/v1/jobs/not-a-uuid",
        "/v1/jobs/not-a-uuid/events",
    ] {
        let res = client.get(srv.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{path}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "not_found");
    }

    let res = client
        .post(srv.url("/v1/jobs/0190a3b2-0000-7000-8000-000000000000/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_then_retry() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (_, created) = create_job(&client, &srv, json!({"tenant_id": "t1", "model": "m"})).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    let res = client
        .post(srv.url(&format!("/v1/jobs/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "cancelled");
    assert_eq!(body["job"]["error_code"], "CANCELLED");

    // Already terminal.
    let res = client
        .post(srv.url(&format!("/v1/jobs/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url(&format!("/v1/admin/jobs/{id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "queued");

    let res = client
        .get(srv.url(&format!("/v1/jobs/{id}/events")))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    let kinds: Vec<_> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["job.created", "job.cancelled", "job.retry_scheduled"]);
}

#[tokio::test]
async fn embedded_worker_runs_jobs_to_success() {
    let srv = TestServer::spawn_with_worker().await;
    let client = reqwest::Client::new();

    let (_, created) = create_job(&client, &srv, json!({"tenant_id": "t1", "model": "m"})).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    let mut snapshot = serde_json::Value::Null;
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/v1/jobs/{id}"))).send().await.unwrap();
        snapshot = res.json().await.unwrap();
        if snapshot["job"]["status"] == "succeeded" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot["job"]["status"], "succeeded");
    assert_eq!(snapshot["job"]["attempt"], 1);
    assert_eq!(snapshot["latest_attempt"]["success"], true);
    assert_eq!(snapshot["latest_attempt"]["provider_meta"]["provider"], "mock-llm");

    let res = client.get(srv.url("/v1/workers")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    let workers = body["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["worker_id"], "worker-1");
    assert_eq!(workers[0]["live"], true);

    let res = client.get(srv.url("/v1/metrics/summary")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["jobs"]["succeeded"], 1);
    assert_eq!(body["jobs"]["total"], 1);
    assert_eq!(body["workers"]["total"], 1);
}
