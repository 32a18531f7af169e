//! API Module
//!
//! HTTP API layer for the server.
//! `rpc` serves agents, `job` serves operators and the CLI.

pub mod auth;
pub mod error;
pub mod health;
pub mod job;
pub mod rpc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::queue::Queue;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<Queue>,
    pub pull_wait: Duration,
    pub wait_poll: Duration,
    pub token: Option<Arc<str>>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(queue: Arc<Queue>, config: &Config) -> Self {
        Self {
            queue,
            pull_wait: config.pull_wait,
            wait_poll: config.wait_poll,
            token: config.token.as_deref().map(Arc::from),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Agent protocol
        .route("/api/rpc/next", post(rpc::next))
        .route("/api/rpc/jobs/{id}/wait", post(rpc::wait))
        .route("/api/rpc/jobs/{id}/extend", post(rpc::extend))
        .route("/api/rpc/jobs/{id}/update", post(rpc::update))
        .route("/api/rpc/jobs/{id}/complete", post(rpc::complete))
        .route("/api/rpc/jobs/{id}/logs", post(rpc::logs))
        .route("/api/rpc/jobs/{id}/artifacts/{step}", post(rpc::save_artifact))
        // Operator endpoints
        .route("/api/jobs", post(job::create_job).get(job::list_jobs))
        .route("/api/jobs/{id}", get(job::get_job))
        .route("/api/jobs/{id}/cancel", post(job::cancel_job))
        .route("/api/jobs/{id}/logs", get(job::get_job_logs))
        .route("/api/jobs/{id}/artifacts", get(job::list_artifacts))
        .route("/api/jobs/{id}/artifacts/{step}", get(job::download_artifact))
        .route("/api/queue/stats", get(job::queue_stats))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::queue::QueueConfig;
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> Router {
        app_with(Config {
            token: token.map(String::from),
            ..Config::default()
        })
    }

    fn app_with(config: Config) -> Router {
        let queue = Arc::new(Queue::new(
            Arc::new(MemoryStorage::new()),
            Notifier::Log,
            QueueConfig::default(),
        ));
        let config = Config {
            pull_wait: Duration::from_millis(20),
            wait_poll: Duration::from_millis(20),
            ..config
        };
        create_router(AppState::new(queue, &config))
    }

    fn upload(id: &str, lease: &serde_json::Value, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/rpc/jobs/{}/artifacts/build?name=report.txt", id))
            .header("content-type", "text/plain")
            .header("x-convoy-agent-id", lease["agent_id"].as_str().unwrap())
            .header("x-convoy-lease-token", lease["token"].as_str().unwrap())
            .body(body.into())
            .unwrap()
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let body = match body {
            Some(v) => Body::from(serde_json::to_string(&v).unwrap()),
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null));
        (status, json)
    }

    fn create_body() -> serde_json::Value {
        serde_json::json!({
            "pipeline": {
                "name": "ci",
                "steps": [{"name": "build", "image": "alpine", "commands": ["make"]}]
            },
            "secrets": [{"name": "TOKEN", "value": "hunter2"}]
        })
    }

    async fn enqueue_and_take(router: &Router) -> (String, serde_json::Value) {
        let (status, job) = call(router, "POST", "/api/jobs", Some(create_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = job["id"].as_str().unwrap().to_string();

        let (status, work) = call(
            router,
            "POST",
            "/api/rpc/next",
            Some(serde_json::json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (id, work["lease"].clone())
    }

    fn claim(lease: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({"agent_id": lease["agent_id"], "token": lease["token"]})
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _) = call(&app(Some("secret")), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_next_returns_no_content_when_idle() {
        let router = app(None);
        let (status, _) = call(
            &router,
            "POST",
            "/api/rpc/next",
            Some(serde_json::json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_operator_api_redacts_secrets() {
        let router = app(None);
        let (_, job) = call(&router, "POST", "/api/jobs", Some(create_body())).await;
        assert_eq!(job["status"], "Pending");
        assert_eq!(job["secrets"][0]["value"], "********");

        let (status, listed) = call(&router, "GET", "/api/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_receives_secret_values() {
        let router = app(None);
        call(&router, "POST", "/api/jobs", Some(create_body())).await;
        let (_, work) = call(
            &router,
            "POST",
            "/api/rpc/next",
            Some(serde_json::json!({"agent_id": "agent-1"})),
        )
        .await;
        assert_eq!(work["job"]["secrets"][0]["value"], "hunter2");
        assert_eq!(work["job"]["status"], "Assigned");
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_bad_request() {
        let router = app(None);
        let (status, body) = call(
            &router,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({"pipeline": {"name": "empty", "steps": []}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no steps"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let router = app(None);
        let uri = format!("/api/jobs/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_extend_with_wrong_token_conflicts() {
        let router = app(None);
        let (id, lease) = enqueue_and_take(&router).await;

        let uri = format!("/api/rpc/jobs/{}/extend", id);
        let (status, _) = call(&router, "POST", &uri, Some(claim(&lease))).await;
        assert_eq!(status, StatusCode::OK);

        let forged = serde_json::json!({"agent_id": "agent-1", "token": uuid::Uuid::new_v4()});
        let (status, _) = call(&router, "POST", &uri, Some(forged)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_full_job_lifecycle() {
        let router = app(None);
        let (id, lease) = enqueue_and_take(&router).await;
        let now = chrono::Utc::now();

        let (status, _) = call(
            &router,
            "POST",
            &format!("/api/rpc/jobs/{}/update", id),
            Some(serde_json::json!({
                "claim": claim(&lease),
                "state": {"started": now, "finished": null, "exited": false, "exit_code": 0, "error": null}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &router,
            "POST",
            &format!("/api/rpc/jobs/{}/logs", id),
            Some(serde_json::json!({
                "claim": claim(&lease),
                "lines": [{"step": "build", "number": 0, "offset_secs": 0, "message": "ok"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, wait) = call(&router, "POST", &format!("/api/rpc/jobs/{}/wait", id), None).await;
        assert_eq!(wait["outcome"], "Pending");

        let (status, done) = call(
            &router,
            "POST",
            &format!("/api/rpc/jobs/{}/complete", id),
            Some(serde_json::json!({
                "claim": claim(&lease),
                "state": {"started": now, "finished": now, "exited": true, "exit_code": 0, "error": null}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "Success");

        let (_, wait) = call(&router, "POST", &format!("/api/rpc/jobs/{}/wait", id), None).await;
        assert_eq!(wait["outcome"], "Finished");

        let (_, logs) = call(&router, "GET", &format!("/api/jobs/{}/logs", id), None).await;
        assert_eq!(logs[0]["message"], "ok");
    }

    #[tokio::test]
    async fn test_cancel_reaches_waiting_agent() {
        let router = app(None);
        let (id, _) = enqueue_and_take(&router).await;

        let (status, job) = call(&router, "POST", &format!("/api/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["cancel_requested"], true);

        let (_, wait) = call(&router, "POST", &format!("/api/rpc/jobs/{}/wait", id), None).await;
        assert_eq!(wait["outcome"], "Cancelled");
    }

    #[tokio::test]
    async fn test_artifact_upload_and_download() {
        let router = app(None);
        let (id, lease) = enqueue_and_take(&router).await;

        let resp = router.clone().oneshot(upload(&id, &lease, "all green")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = Request::builder()
            .uri(format!("/api/jobs/{}/artifacts/build", id))
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"all green");
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let router = app(Some("secret"));

        let (status, _) = call(&router, "GET", "/api/queue/stats", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/queue/stats")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_artifact_claim_is_not_taken_from_query() {
        let router = app(None);
        let (id, lease) = enqueue_and_take(&router).await;

        let uri = format!(
            "/api/rpc/jobs/{}/artifacts/build?agent_id={}&token={}&name=report.txt",
            id,
            lease["agent_id"].as_str().unwrap(),
            lease["token"].as_str().unwrap()
        );
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from("all green"))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut req = upload(&id, &lease, "all green");
        req.headers_mut()
            .insert("x-convoy-lease-token", "not-a-uuid".parse().unwrap());
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_artifact_larger_than_two_megabytes_is_accepted() {
        let router = app(None);
        let (id, lease) = enqueue_and_take(&router).await;

        let payload = vec![b'x'; 3 * 1024 * 1024];
        let resp = router.clone().oneshot(upload(&id, &lease, payload)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let (_, artifacts) = call(&router, "GET", &format!("/api/jobs/{}/artifacts", id), None).await;
        assert_eq!(artifacts[0]["size"], 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_body_over_limit_is_rejected() {
        let router = app_with(Config {
            max_body_bytes: 1024,
            ..Config::default()
        });
        let (id, lease) = enqueue_and_take(&router).await;

        let resp = router
            .clone()
            .oneshot(upload(&id, &lease, vec![0u8; 4096]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
