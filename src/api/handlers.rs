use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::engine::types::ScheduleData;
use crate::ledger::Run;
use crate::lifecycle::{LaunchedRun, StartServiceRequest};
use crate::probe::{self, ServicesPresence};

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct StopServiceRequest {
    pub node_id: String,
}

#[derive(Serialize)]
pub struct OperationInfo {
    pub name: String,
    pub groups: Vec<String>,
    pub steps: Vec<String>,
    pub initial_context_keys: Vec<String>,
    pub cancellable: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /services/start
pub async fn start_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartServiceRequest>,
) -> Result<(StatusCode, Json<LaunchedRun>), AppError> {
    if req.node_id.trim().is_empty() || req.image.trim().is_empty() {
        return Err(AppError::BadRequest(
            "'node_id' and 'image' are required".to_string(),
        ));
    }
    let launched = state.lifecycle.start_service(&req).await?;
    Ok((StatusCode::ACCEPTED, Json(launched)))
}

/// POST /services/stop
pub async fn stop_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopServiceRequest>,
) -> Result<(StatusCode, Json<LaunchedRun>), AppError> {
    if req.node_id.trim().is_empty() {
        return Err(AppError::BadRequest("'node_id' is required".to_string()));
    }
    let launched = state.lifecycle.stop_service(&req.node_id).await?;
    Ok((StatusCode::ACCEPTED, Json(launched)))
}

/// GET /services/:node_id/presence
pub async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<Json<ServicesPresence>, AppError> {
    let presence = probe::get_services_presence(state.runtime.as_ref(), &node_id).await?;
    Ok(Json(presence))
}

/// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let runs = state.ledger.get_all_runs().await?;
    Ok(Json(serde_json::json!({
        "total": runs.len(),
        "runs": runs,
    })))
}

/// GET /runs/:id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    let run = find_run(&state, &id).await?;
    Ok(Json(run))
}

/// DELETE /runs/:id
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    find_run(&state, &id).await?;
    state.ledger.remove_run(&id).await?;

    Ok(Json(serde_json::json!({
        "deleted": id,
    })))
}

/// POST /runs/:id/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    find_run(&state, &id).await?;
    state.ledger.cancel_run(&id).await?;
    Ok(Json(find_run(&state, &id).await?))
}

/// POST /runs/:id/manual-intervention
pub async fn flag_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    find_run(&state, &id).await?;
    state.ledger.set_waiting_manual_intervention(&id).await?;
    Ok(Json(find_run(&state, &id).await?))
}

/// GET /schedules/:id
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduleData>, AppError> {
    Ok(Json(state.scheduler.get_schedule(&id).await?))
}

/// POST /schedules/:id/cancel
pub async fn cancel_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.scheduler.cancel_operation(&id).await?;
    Ok(Json(serde_json::json!({
        "cancelled": id,
    })))
}

/// POST /schedules/:id/steps/:step/restart
///
/// Picks the revert or manual-intervention variant from the schedule's direction.
pub async fn restart_step(
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let schedule = state.scheduler.get_schedule(&id).await?;
    if schedule.is_reverting {
        state
            .scheduler
            .restart_step_stuck_during_revert(&id, &step)
            .await?;
    } else {
        state
            .scheduler
            .restart_step_stuck_in_manual_intervention(&id, &step)
            .await?;
    }
    Ok(Json(serde_json::json!({
        "schedule_id": id,
        "restarted": step,
    })))
}

/// GET /operations
pub async fn list_operations(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let operations: Vec<OperationInfo> = state
        .scheduler
        .registry()
        .list()
        .into_iter()
        .map(|(name, op)| OperationInfo {
            name: name.to_string(),
            groups: op
                .step_groups()
                .iter()
                .enumerate()
                .map(|(i, g)| g.name(i))
                .collect(),
            steps: op
                .step_groups()
                .iter()
                .flat_map(|g| g.steps())
                .map(|s| s.name().to_string())
                .collect(),
            initial_context_keys: op.initial_context_required_keys().iter().cloned().collect(),
            cancellable: op.is_cancellable(),
        })
        .collect();

    let total = operations.len();
    Json(serde_json::json!({
        "operations": operations,
        "total": total,
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

async fn find_run(state: &AppState, id: &str) -> Result<Run, AppError> {
    state
        .ledger
        .get_run(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run '{}' not found", id)))
}
