//! HTTP/JSON surface of the governance core.
//!
//! Error responses always carry the structured body
//! `{code, category, retriable, message, details?}` so programmatic
//! callers can branch on `code`/`retriable` without string matching.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use traceline_common::{CoreError, EntityKind, Severity};

use crate::audit::{AuditFilter, AuditLog, NewAuditEvent};
use crate::governor::Governor;
use crate::lifecycle::LifecycleEngine;
use crate::registry::{
    CreateAttempt, CreateJob, CreateMission, CreatePlan, CreateResource, IdentityRegistry,
};
use crate::telemetry::Telemetry;

pub mod server;
pub mod ws;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<IdentityRegistry>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub audit: Arc<AuditLog>,
    pub telemetry: Arc<Telemetry>,
    pub governor: Arc<Governor>,
    pub events_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub entity_id: String,
    pub target_state: String,
    pub transition_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct AuditQueryParams {
    pub mission_id: Option<String>,
    pub plan_id: Option<String>,
    pub job_id: Option<String>,
    pub attempt_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct DecideRequest {
    pub job_type: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

// ── Error handling ────────────────────────────────────────────────────

/// Wrapper rendering a `CoreError` as the structured error body.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            CoreError::UnknownState { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            CoreError::PolicyCooldown { .. } => StatusCode::FORBIDDEN,
            CoreError::RetryBudgetExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Storage(_) | CoreError::OrphanKilled { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let details = match &err {
            CoreError::InvalidStateTransition { kind, from, to } => Some(serde_json::json!({
                "entity_type": kind.as_str(),
                "current_state": from,
                "target_state": to,
            })),
            CoreError::NotFound { kind, id } | CoreError::Conflict { kind, id } => {
                Some(serde_json::json!({
                    "entity_type": kind.as_str(),
                    "id": id,
                }))
            }
            _ => None,
        };
        // Storage internals stay out of the response body.
        let message = match &err {
            CoreError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "code": err.code(),
            "category": err.category().as_str(),
            "retriable": err.retriable(),
            "message": message,
            "details": details,
        });
        (status, Json(body)).into_response()
    }
}

fn parse_kind(value: &str) -> Result<EntityKind, ApiError> {
    EntityKind::from_str(value).map_err(|_| {
        ApiError(CoreError::InvalidRequest {
            message: format!("unknown entity type '{}'", value),
        })
    })
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/v1/identity/mission", post(create_mission))
        .route("/v1/identity/plan", post(create_plan))
        .route("/v1/identity/job", post(create_job))
        .route("/v1/identity/attempt", post(create_attempt))
        .route("/v1/identity/resource", post(create_resource))
        .route("/v1/identity/trace/{entity_type}/{entity_id}", get(get_trace))
        .route("/v1/identity/{entity_type}/{entity_id}", get(get_entity))
        .route("/v1/lifecycle/transition/{entity_type}", post(post_transition))
        .route("/v1/lifecycle/state/{entity_type}/{entity_id}", get(get_state))
        .route(
            "/v1/lifecycle/history/{entity_type}/{entity_id}",
            get(get_history),
        )
        .route("/v1/audit/log", post(post_audit_event))
        .route("/v1/audit/events", get(get_audit_events))
        .route("/v1/audit/stats", get(get_audit_stats))
        .route("/v1/telemetry/snapshot", get(get_snapshot))
        .route("/v1/telemetry/metrics", get(get_metrics))
        .route("/v1/governor/decide", post(post_decide))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_mission(
    State(state): State<SharedState>,
    Json(req): Json<CreateMission>,
) -> Result<impl IntoResponse, ApiError> {
    let mission = state.registry.create_mission(req).await?;
    Ok((StatusCode::CREATED, Json(mission)))
}

async fn create_plan(
    State(state): State<SharedState>,
    Json(req): Json<CreatePlan>,
) -> Result<impl IntoResponse, ApiError> {
    let plan = state.registry.create_plan(req).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.registry.create_job(req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn create_attempt(
    State(state): State<SharedState>,
    Json(req): Json<CreateAttempt>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = state.registry.create_attempt(req).await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

async fn create_resource(
    State(state): State<SharedState>,
    Json(req): Json<CreateResource>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state.registry.create_resource(req).await?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn get_entity(
    State(state): State<SharedState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&entity_type)?;
    let entity = state.registry.get(kind, &entity_id).await?;
    Ok(Json(entity))
}

async fn get_trace(
    State(state): State<SharedState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&entity_type)?;
    let chain = state.registry.trace_chain(kind, &entity_id).await?;
    Ok(Json(chain))
}

async fn post_transition(
    State(state): State<SharedState>,
    Path(entity_type): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&entity_type)?;
    let transition = state
        .lifecycle
        .transition(
            kind,
            &req.entity_id,
            &req.target_state,
            req.transition_type,
            req.metadata,
        )
        .await?;
    Ok(Json(transition))
}

async fn get_state(
    State(state): State<SharedState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&entity_type)?;
    let current = state.lifecycle.current_state(kind, &entity_id).await?;
    Ok(Json(current))
}

async fn get_history(
    State(state): State<SharedState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&entity_type)?;
    let history = state
        .lifecycle
        .history(kind, &entity_id, params.limit)
        .await?;
    Ok(Json(history))
}

async fn post_audit_event(
    State(state): State<SharedState>,
    Json(req): Json<NewAuditEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state.audit.log(req).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn get_audit_events(
    State(state): State<SharedState>,
    Query(params): Query<AuditQueryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let severity = params
        .severity
        .as_deref()
        .map(|s| {
            Severity::from_str(s).map_err(|_| {
                ApiError(CoreError::InvalidRequest {
                    message: format!("unknown severity '{}'", s),
                })
            })
        })
        .transpose()?;
    let filter = AuditFilter {
        mission_id: params.mission_id,
        plan_id: params.plan_id,
        job_id: params.job_id,
        attempt_id: params.attempt_id,
        event_type: params.event_type,
        severity,
    };
    let (events, total) = state
        .audit
        .query_events(filter, params.limit, params.offset)
        .await?;
    Ok(Json(serde_json::json!({
        "events": events,
        "total": total,
    })))
}

async fn get_audit_stats(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.audit.stats().await?;
    Ok(Json(stats))
}

async fn get_snapshot(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.telemetry.snapshot().await?;
    Ok(Json(snapshot))
}

async fn get_metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.telemetry.raw_metrics()))
}

async fn post_decide(
    State(state): State<SharedState>,
    Json(req): Json<DecideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = state.governor.decide(&req.job_type, &req.context).await?;
    Ok(Json(decision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_transition_renders_structured_body() {
        let err = ApiError(CoreError::InvalidStateTransition {
            kind: EntityKind::Mission,
            from: Some("planning".into()),
            to: "completed".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body["code"], "NR-E001");
        assert_eq!(body["category"], "system");
        assert_eq!(body["retriable"], false);
        assert_eq!(body["details"]["current_state"], "planning");
        assert_eq!(body["details"]["target_state"], "completed");
    }

    #[tokio::test]
    async fn storage_errors_hide_internals() {
        let err = ApiError(CoreError::storage(anyhow::anyhow!(
            "disk I/O error at offset 4096 in wal frame 17"
        )));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["code"], "NR-E005");
        assert_eq!(body["retriable"], true);
        assert_eq!(body["message"], "internal storage error");
    }

    #[tokio::test]
    async fn not_found_carries_entity_details() {
        let err = ApiError(CoreError::NotFound {
            kind: EntityKind::Attempt,
            id: "a_missing".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["code"], "NR-E002");
        assert_eq!(body["details"]["entity_type"], "attempt");
        assert_eq!(body["details"]["id"], "a_missing");
    }

    #[test]
    fn parse_kind_rejects_unknown_types() {
        assert!(parse_kind("mission").is_ok());
        assert!(parse_kind("widget").is_err());
    }
}
