//! API routes for remedyd
//!
//! Every handler forwards to one `Engine` operation. Errors carry their kind
//! in a `{kind, message}` body with a matching status code.

use crate::engine::{EngineHealth, IssueListing};
use crate::monitor::TickReport;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use remedy_common::{
    ActionQuery, ActionRecord, Choice, ErrorKind, Issue, IssueFilter, IssueId, RemedyError,
    SelectionOutcome, SessionId, SessionView,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

type AppStateArc = Arc<AppState>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

pub struct ApiError(RemedyError);

impl From<RemedyError> for ApiError {
    fn from(err: RemedyError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExecutionFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("  Request failed: {}", self.0);
        }
        let body = ErrorBody {
            kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Health & Detection Routes
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/detect", post(detect))
}

async fn health(State(state): State<AppStateArc>) -> Json<EngineHealth> {
    Json(state.engine.health())
}

async fn detect(State(state): State<AppStateArc>) -> Json<TickReport> {
    info!("  Detection requested");
    Json(state.engine.detect_now().await)
}

// ============================================================================
// Issue Routes
// ============================================================================

pub fn issue_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/issues", get(list_issues))
        .route("/v1/issues/:id/acknowledge", post(acknowledge_issue))
}

async fn list_issues(
    State(state): State<AppStateArc>,
    Query(filter): Query<IssueFilter>,
) -> Json<IssueListing> {
    Json(state.engine.list_open_issues(&filter))
}

async fn acknowledge_issue(
    State(state): State<AppStateArc>,
    Path(id): Path<IssueId>,
) -> ApiResult<Issue> {
    Ok(Json(state.engine.acknowledge_issue(id).await?))
}

// ============================================================================
// Wizard Routes
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StartWizardRequest {
    pub issue_id: IssueId,
}

pub fn wizard_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/wizard", post(start_wizard))
        .route("/v1/wizard/:id", get(session_state))
        .route("/v1/wizard/:id/select", post(select_suggestion))
        .route("/v1/wizard/:id/cancel", post(cancel_session))
}

async fn start_wizard(
    State(state): State<AppStateArc>,
    Json(req): Json<StartWizardRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    info!("  Starting wizard for issue {}", req.issue_id);
    let session = state.engine.start_wizard(req.issue_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn session_state(
    State(state): State<AppStateArc>,
    Path(id): Path<SessionId>,
) -> ApiResult<SessionView> {
    Ok(Json(state.engine.get_session_state(id).await?))
}

async fn select_suggestion(
    State(state): State<AppStateArc>,
    Path(id): Path<SessionId>,
    Json(choice): Json<Choice>,
) -> ApiResult<SelectionOutcome> {
    Ok(Json(state.engine.select_suggestion(id, choice).await?))
}

async fn cancel_session(
    State(state): State<AppStateArc>,
    Path(id): Path<SessionId>,
) -> ApiResult<SessionView> {
    Ok(Json(state.engine.cancel_session(id).await?))
}

// ============================================================================
// Action History Routes
// ============================================================================

pub fn action_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/actions", get(action_history))
}

async fn action_history(
    State(state): State<AppStateArc>,
    Query(query): Query<ActionQuery>,
) -> ApiResult<Vec<ActionRecord>> {
    Ok(Json(state.engine.get_action_history(&query)?))
}
