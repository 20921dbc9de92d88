//! HTTP front end.
//!
//! Accepts questions from users, exposes session state for polling, and
//! hands jobs to workers. The front end never calls the language model; it
//! only moves sessions through the job queue.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/` | – | Create a session, redirect to `/session?uuid=…` |
//! | `GET`  | `/new_session` | – | Create a session, return its id |
//! | `GET`  | `/session` | – | Confirm a session exists (redirect to `/` if not) |
//! | `POST` | `/add_question` | – | Queue a question (form `uuid`, `question`) |
//! | `GET`  | `/get_state` | – | Session state |
//! | `GET`  | `/get_state_and_conversation` | – | State, conversation and citations |
//! | `GET`  | `/get_heartbeat` | – | Seconds since the worker's last heartbeat |
//! | `GET`  | `/heartbeat` | secret | Record a worker heartbeat |
//! | `GET`  | `/claim_job` | secret | Claim the next queued job, `{}` if none |
//! | `POST` | `/finish_job` | secret | Store a worker's answer |
//! | `GET`  | `/get_state_count` | secret | Sessions per state |
//! | `GET`  | `/get_state_latest_age` | secret | Age of the newest session per state |
//! | `GET`  | `/health` | – | Health check (returns version) |
//!
//! # Error Contract
//!
//! User-facing session errors are reported in-band as
//! `{"msg": "Error: invalid session"}` with status 200. A wrong or missing
//! worker secret is a bare 403. Everything else uses the JSON envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "conversation is not a JSON list" } }
//! ```

use axum::{
    extract::{Form, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::liveness;
use crate::migrate;
use crate::queue::JobQueue;
use crate::store::SqliteStore;
use crate::wire::{ClaimPayload, FinishForm};

const INVALID_SESSION: &str = "Error: invalid session";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    queue: JobQueue,
    /// Worker secret; `None` rejects every authenticated request.
    secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(queue: JobQueue, secret: Option<&str>) -> Self {
        Self {
            queue,
            secret: secret.map(Arc::from),
        }
    }

    fn authorize(&self, presented: Option<&str>) -> Result<(), AppError> {
        match (self.secret.as_deref(), presented) {
            (Some(expected), Some(given)) if !expected.is_empty() && expected == given => Ok(()),
            _ => Err(forbidden()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/new_session", get(handle_new_session))
        .route("/session", get(handle_session))
        .route("/add_question", post(handle_add_question))
        .route("/get_state", get(handle_get_state))
        .route("/get_state_and_conversation", get(handle_get_state_and_conversation))
        .route("/get_heartbeat", get(handle_get_heartbeat))
        .route("/heartbeat", get(handle_heartbeat))
        .route("/claim_job", get(handle_claim_job))
        .route("/finish_job", post(handle_finish_job))
        .route("/get_state_count", get(handle_get_state_count))
        .route("/get_state_latest_age", get(handle_get_state_latest_age))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the front end on `[server].bind` and serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    if config.server_secret().is_none() {
        tracing::warn!(
            "no preshared secret configured; worker endpoints will reject every request"
        );
    }

    let queue = JobQueue::new(
        Arc::new(SqliteStore::new(pool.clone())),
        config.queue.claim_order,
    );
    let app = router(AppState::new(queue, config.server_secret()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("stuart listening on http://{}", config.server.bind);
    tracing::info!(bind = %config.server.bind, "front end started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    pool.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::FORBIDDEN {
            return self.status.into_response();
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Store failures are logged in full and reported without detail.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: "internal error".to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn forbidden() -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: String::new(),
    }
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn invalid_session() -> Json<Value> {
    Json(json!({ "msg": INVALID_SESSION }))
}

// ============ Extractors ============

#[derive(Deserialize)]
struct UuidQuery {
    uuid: Option<String>,
}

#[derive(Deserialize)]
struct SecretQuery {
    secret: Option<String>,
}

#[derive(Deserialize)]
struct QuestionForm {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    question: String,
}

// ============ Session endpoints ============

async fn handle_root(State(state): State<AppState>) -> Result<Response, AppError> {
    let id = state.queue.create_session().await?;
    Ok(redirect(&format!("/session?uuid={}", id)))
}

async fn handle_new_session(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let id = state.queue.create_session().await?;
    Ok(Json(json!({ "msg": "OK", "uuid": id })))
}

async fn handle_session(
    State(state): State<AppState>,
    Query(query): Query<UuidQuery>,
) -> Result<Response, AppError> {
    let Some(id) = query.uuid else {
        return Ok(redirect("/"));
    };
    match state.queue.state(&id).await? {
        Some(_) => Ok(Json(json!({ "msg": "OK", "uuid": id })).into_response()),
        None => Ok(redirect("/")),
    }
}

async fn handle_add_question(
    State(state): State<AppState>,
    Form(form): Form<QuestionForm>,
) -> Result<Json<Value>, AppError> {
    if state.queue.enqueue(&form.uuid, &form.question).await? {
        Ok(Json(json!({ "msg": "OK" })))
    } else {
        Ok(invalid_session())
    }
}

async fn handle_get_state(
    State(state): State<AppState>,
    Query(query): Query<UuidQuery>,
) -> Result<Json<Value>, AppError> {
    let id = query.uuid.unwrap_or_default();
    match state.queue.state(&id).await? {
        Some(s) => Ok(Json(json!({ "msg": "OK", "state": s }))),
        None => Ok(invalid_session()),
    }
}

async fn handle_get_state_and_conversation(
    State(state): State<AppState>,
    Query(query): Query<UuidQuery>,
) -> Result<Json<Value>, AppError> {
    let id = query.uuid.unwrap_or_default();
    match state.queue.session(&id).await? {
        Some(session) => Ok(Json(json!({
            "msg": "OK",
            "state": session.state,
            "conversation": session.conversation,
            "source": session.source,
        }))),
        None => Ok(invalid_session()),
    }
}

async fn handle_get_heartbeat(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let age = liveness::heartbeat_age(state.queue.store().as_ref()).await?;
    Ok(Json(json!({ "age": age })))
}

// ============ Worker endpoints ============

async fn handle_heartbeat(
    State(state): State<AppState>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, AppError> {
    state.authorize(query.secret.as_deref())?;
    liveness::heartbeat(state.queue.store().as_ref()).await?;
    Ok(Json(json!({ "msg": "OK" })))
}

async fn handle_claim_job(
    State(state): State<AppState>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, AppError> {
    state.authorize(query.secret.as_deref())?;
    match state.queue.claim().await? {
        Some(job) => {
            let payload = ClaimPayload::from_job(&job).map_err(anyhow::Error::from)?;
            Ok(Json(serde_json::to_value(payload).map_err(anyhow::Error::from)?))
        }
        None => Ok(Json(json!({}))),
    }
}

async fn handle_finish_job(
    State(state): State<AppState>,
    Form(form): Form<FinishForm>,
) -> Result<Json<Value>, AppError> {
    state.authorize(Some(form.secret.as_str()))?;
    let finished = form
        .decode()
        .map_err(|e| bad_request(format!("invalid finish_job payload: {}", e)))?;
    state
        .queue
        .finish(
            &form.uuid,
            &finished.conversation_llm,
            &finished.conversation,
            &finished.source,
        )
        .await?;
    Ok(Json(json!({ "msg": "OK" })))
}

async fn handle_get_state_count(
    State(state): State<AppState>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, AppError> {
    state.authorize(query.secret.as_deref())?;
    let counts: Map<String, Value> = state
        .queue
        .state_counts()
        .await?
        .into_iter()
        .map(|(s, n)| (s.as_str().to_string(), json!(n)))
        .collect();
    Ok(Json(Value::Object(counts)))
}

async fn handle_get_state_latest_age(
    State(state): State<AppState>,
    Query(query): Query<SecretQuery>,
) -> Result<Json<Value>, AppError> {
    state.authorize(query.secret.as_deref())?;
    let ages: Map<String, Value> = state
        .queue
        .latest_age_by_state()
        .await?
        .into_iter()
        .map(|a| (a.state.as_str().to_string(), json!(a.age)))
        .collect();
    Ok(Json(Value::Object(ages)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
