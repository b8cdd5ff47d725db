//! The HTTP submission/admin API and the WebSocket event stream.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, Instant};
use tracing::{debug, error};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::dispatcher::{AdminAction, Dispatcher, EnqueueRequest, Enqueued};
use crate::error::StoreError;
use crate::job::JobStatus;
use crate::store::{JobFilter, JobStore};

/// How often subscribers are pinged.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A subscriber silent for this long is disconnected.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Enqueue and admin operations.
    pub dispatcher: Arc<Dispatcher>,
    /// Read-side queries.
    pub store: Arc<dyn JobStore>,
    /// Event stream source.
    pub bus: Arc<EventBus>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/admin/jobs/{id}/retry", post(retry_job))
        .route("/admin/jobs/{id}/cancel", post(cancel_job))
        .route("/stats", get(job_stats))
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Response {
    if request.max_retries.is_some_and(|retries| retries < 0) {
        return error_response(StatusCode::BAD_REQUEST, "max_retries must be non-negative");
    }
    match state.dispatcher.enqueue(request).await {
        Ok(Enqueued {
            job_id,
            deduplicated: false,
        }) => (
            StatusCode::CREATED,
            Json(json!({"job_id": job_id, "status": "queued"})),
        )
            .into_response(),
        Ok(Enqueued {
            job_id,
            deduplicated: true,
        }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "job_id": job_id,
                "error": "a job with this idempotency key already exists",
            })),
        )
            .into_response(),
        Err(error) => store_error(&error),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    queue: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let status = match params
        .status
        .filter(|s| !s.is_empty())
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
    {
        Ok(status) => status,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, &error.to_string()),
    };
    let filter = JobFilter {
        status,
        queue: params.queue.filter(|q| !q.is_empty()),
        limit: params.limit,
    };
    match state.store.list_jobs(filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(error) => store_error(&error),
    }
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let job = match state.store.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "job not found"),
        Err(error) => return store_error(&error),
    };
    match state.store.list_attempts(id).await {
        Ok(attempts) => Json(json!({"job": job, "attempts": attempts})).into_response(),
        Err(error) => store_error(&error),
    }
}

async fn retry_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.force_retry(id).await {
        Ok(AdminAction::Applied) => Json(json!({"status": "retry scheduled"})).into_response(),
        Ok(AdminAction::NotFound) => error_response(StatusCode::NOT_FOUND, "job not found"),
        Ok(AdminAction::Rejected) => {
            error_response(StatusCode::CONFLICT, "job is not in a retryable state")
        }
        Err(error) => store_error(&error),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.cancel(id).await {
        Ok(AdminAction::Applied) => Json(json!({"status": "job cancelled"})).into_response(),
        Ok(AdminAction::NotFound) => error_response(StatusCode::NOT_FOUND, "job not found"),
        Ok(AdminAction::Rejected) => {
            error_response(StatusCode::CONFLICT, "job is already in a terminal state")
        }
        Err(error) => store_error(&error),
    }
}

async fn job_stats(State(state): State<AppState>) -> Response {
    match state.store.job_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(error) => store_error(&error),
    }
}

async fn healthz() -> Response {
    Json(json!({"status": "healthy"})).into_response()
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let bus = Arc::clone(&state.bus);
    upgrade.on_upgrade(move |socket| subscriber_loop(socket, bus))
}

/// Forward bus events to one WebSocket client. Client messages are ignored
/// except pongs, which feed the liveness check.
async fn subscriber_loop(socket: WebSocket, bus: Arc<EventBus>) {
    let mut subscription = bus.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut ping = interval(PING_INTERVAL);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    // Bus closed: the server is shutting down.
                    break;
                };
                if sink.send(Message::Text(event.to_json().into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("subscriber unresponsive, disconnecting");
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(%error, "subscriber read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn store_error(error: &StoreError) -> Response {
    error!(%error, "store operation failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "store operation failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::memory::MemoryStore;
    use crate::registry::HandlerRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::new(HandlerRegistry::new()),
            Arc::clone(&bus),
            DispatcherConfig::default(),
        ));
        router(AppState {
            dispatcher,
            store,
            bus,
        })
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_returns_created() {
        let app = test_router();
        let response = app
            .oneshot(post_json(
                "/jobs",
                r#"{"queue":"default","payload":{"x":1},"max_retries":3}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let app = test_router();
        let response = app
            .oneshot(post_json("/jobs", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_conflicts() {
        let app = test_router();
        let body = r#"{"queue":"default","idempotency_key":"k1"}"#;
        let first = app.clone().oneshot(post_json("/jobs", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = app.oneshot(post_json("/jobs", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_status_filter_is_rejected() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn enqueued_job_id(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["job_id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn job_detail_includes_attempts() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(post_json("/jobs", r#"{"queue":"default"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job_id = enqueued_job_id(response).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["job"]["id"].as_str(), Some(job_id.as_str()));
        assert_eq!(value["attempts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn retrying_a_job_that_has_not_failed_conflicts() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(post_json("/jobs", r#"{"queue":"default"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job_id = enqueued_job_id(response).await;

        // The job is still pending, so a forced retry has nothing to rerun.
        let response = app
            .oneshot(post_json(&format!("/admin/jobs/{job_id}/retry"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let app = test_router();
        let response = app
            .oneshot(post_json(
                &format!("/admin/jobs/{}/cancel", Uuid::new_v4()),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
