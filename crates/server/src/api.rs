// Signup and run inspection HTTP routes

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use flowline_durable::{Engine, EngineError, HistoryEntry, RunFilter, RunInfo, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signup::{SignupInput, UserSignup};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Sleep recorded into each new signup run
    pub signup_sleep: Duration,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, signup_sleep: Duration) -> Self {
        Self {
            engine,
            signup_sleep,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignupResponse {
    pub run_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// Query parameters for listing runs
#[derive(Debug, Deserialize)]
pub struct ListRunsParams {
    pub status: Option<String>,
    pub workflow_type: Option<String>,
    pub limit: Option<usize>,
}

/// Response wrapper for list endpoints
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn engine_error(e: EngineError) -> ApiError {
    match e {
        EngineError::RunNotFound(_) => error(StatusCode::NOT_FOUND, "Run not found"),
        EngineError::RunTerminal(_) => error(StatusCode::CONFLICT, e.to_string()),
        EngineError::Registry(_) => error(StatusCode::BAD_REQUEST, e.to_string()),
        other => {
            tracing::error!("Engine request failed: {}", other);
            error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Create signup and run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/signup", post(signup))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/events", get(list_run_events))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .with_state(state)
}

/// POST /v1/signup - Start a signup workflow and return without waiting for it
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), ApiError> {
    let email = req.email.trim().to_string();
    if email.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "email is required"));
    }

    let run_id = state
        .engine
        .start_workflow::<UserSignup>(SignupInput::new(email, state.signup_sleep))
        .await
        .map_err(engine_error)?;
    tracing::info!(%run_id, "signup accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SignupResponse {
            run_id,
            message: "User signup workflow started".to_string(),
        }),
    ))
}

/// GET /v1/runs - List runs, newest first
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<ListResponse<RunInfo>>, ApiError> {
    let mut filter = RunFilter::default();
    if let Some(status) = params.status.as_deref() {
        let status: RunStatus = status
            .parse()
            .map_err(|e: String| error(StatusCode::BAD_REQUEST, e))?;
        filter = filter.with_status(status);
    }
    if let Some(workflow_type) = params.workflow_type {
        filter = filter.with_workflow_type(workflow_type);
    }
    if let Some(limit) = params.limit {
        filter = filter.with_limit(limit);
    }

    let runs = state
        .engine
        .list_runs(&filter)
        .await
        .map_err(engine_error)?;
    Ok(Json(ListResponse { data: runs }))
}

/// GET /v1/runs/:run_id - Current status of a run
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunInfo>, ApiError> {
    let run = state.engine.run(run_id).await.map_err(engine_error)?;
    Ok(Json(run))
}

/// GET /v1/runs/:run_id/events - Full history of a run
pub async fn list_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ListResponse<HistoryEntry>>, ApiError> {
    let events = state.engine.history(run_id).await.map_err(engine_error)?;
    Ok(Json(ListResponse { data: events }))
}

/// POST /v1/runs/:run_id/cancel - Cancel a run that has not finished
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    req: Option<Json<CancelRequest>>,
) -> Result<Json<RunInfo>, ApiError> {
    let reason = req
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "cancelled via API".to_string());

    let run = state
        .engine
        .cancel(run_id, &reason)
        .await
        .map_err(engine_error)?;
    tracing::info!(%run_id, %reason, "run cancelled");
    Ok(Json(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use flowline_durable::prelude::*;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::signup;

    const SLEEP: Duration = Duration::from_secs(3600);

    fn input(email: &str) -> SignupInput {
        SignupInput::new(email, SLEEP)
    }

    async fn test_app() -> (Router, Arc<Engine>) {
        let config = ServerConfig {
            signup_sleep: SLEEP,
            welcome_failure_rate: 0.0,
            ..ServerConfig::default()
        };
        let builder = EngineBuilder::new(Arc::new(InMemoryEventStore::new())).config(
            EngineConfig::default().with_timer_poll_interval(Duration::from_millis(10)),
        );
        let engine = Arc::new(
            signup::register(builder, &config)
                .start()
                .await
                .expect("engine should start"),
        );
        (routes(AppState::new(engine.clone(), config.signup_sleep)), engine)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_signup_is_accepted_immediately() {
        let (app, engine) = test_app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/v1/signup",
            Some(json!({ "email": "ada@example.com" })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "User signup workflow started");
        let run_id: Uuid = serde_json::from_value(body["run_id"].clone()).unwrap();

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.workflow_type, "user_signup");
        assert!(!run.status.is_terminal());
        assert_eq!(run.input["email"], "ada@example.com");
        assert_eq!(run.input["sleep_ms"], 3_600_000);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_signup_requires_email() {
        let (app, engine) = test_app().await;

        let (status, body) = send(&app, "POST", "/v1/signup", Some(json!({ "email": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "email is required");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_run_and_events() {
        let (app, engine) = test_app().await;
        let run_id = engine
            .start_workflow::<UserSignup>(input("ada@example.com"))
            .await
            .unwrap();

        let (status, body) = send(&app, "GET", &format!("/v1/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], json!(run_id));
        assert_eq!(body["workflow_type"], "user_signup");

        let (status, body) = send(&app, "GET", &format!("/v1/runs/{run_id}/events"), None).await;
        assert_eq!(status, StatusCode::OK);
        let events = body["data"].as_array().expect("events array");
        assert_eq!(events[0]["sequence"], 0);
        assert_eq!(events[0]["event"]["type"], "run_started");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (app, engine) = test_app().await;
        let missing = Uuid::now_v7();

        let (status, body) = send(&app, "GET", &format!("/v1/runs/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Run not found");

        let (status, _) = send(&app, "GET", &format!("/v1/runs/{missing}/events"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_status() {
        let (app, engine) = test_app().await;
        engine
            .start_workflow::<UserSignup>(input("ada@example.com"))
            .await
            .unwrap();

        let (status, body) = send(&app, "GET", "/v1/runs?workflow_type=user_signup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/v1/runs?status=completed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = send(&app, "GET", "/v1/runs?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_run_then_conflict() {
        let (app, engine) = test_app().await;
        let run_id = engine
            .start_workflow::<UserSignup>(input("ada@example.com"))
            .await
            .unwrap();

        let uri = format!("/v1/runs/{run_id}/cancel");
        let (status, body) = send(&app, "POST", &uri, Some(json!({ "reason": "duplicate" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already finished"));

        engine.shutdown().await.unwrap();
    }
}
