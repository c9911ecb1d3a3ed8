//! HTTP handlers for the REST API.
//!
//! Mutating handlers hold an `EditPermit` for the whole call, so the edit lock
//! cannot change hands while the engine is writing.

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use ulid::Ulid;

use super::dto::*;
use super::error::{AppError, REVISION_HEADER};
use super::identity::{Caller, MaybeCaller};
use super::state::AppState;
use crate::engine::AssignmentFilter;
use crate::lock::LockStatus;
use crate::model::*;
use crate::solver::SolverRequest;
use crate::transfer::{self, AllocateReport, AllocateRequest, ExportRequest, ImportReport, Snapshot};

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn revision_headers(revision: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(REVISION_HEADER, HeaderValue::from(revision));
    headers
}

fn parse_ulid(raw: &str) -> Result<Ulid, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid id {raw:?}")))
}

// =============================================================================
// Health Check
// =============================================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let plan = state.engine.read().await;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        groups: plan.groups.len(),
        locations: plan.locations.len(),
        assignments: plan.assignments.len(),
        solver_backend: state.solver.backend().name().to_string(),
    }))
}

// =============================================================================
// Edit lock
// =============================================================================

/// GET /lock/status
pub async fn lock_status(State(state): State<AppState>, MaybeCaller(who): MaybeCaller) -> HandlerResult<LockStatus> {
    Ok(Json(state.lock.status(who.as_ref()).await?))
}

/// POST /lock/acquire
///
/// Body is optional; `{"force": true}` is honoured for the automation user only.
pub async fn acquire_lock(
    State(state): State<AppState>,
    Caller(who): Caller,
    body: Bytes,
) -> HandlerResult<LockResponse> {
    let request: AcquireLockRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AcquireLockRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };
    let record = state.lock.acquire(&who, request.force).await?;
    Ok(Json(LockResponse {
        success: true,
        message: format!("lock held by {} until {}", record.holder, record.expires_at),
        lock: state.lock.status(Some(&who)).await?,
    }))
}

/// POST /lock/renew
pub async fn renew_lock(State(state): State<AppState>, Caller(who): Caller) -> HandlerResult<LockResponse> {
    let record = state.lock.renew(&who).await?;
    Ok(Json(LockResponse {
        success: true,
        message: format!("lock renewed until {}", record.expires_at),
        lock: state.lock.status(Some(&who)).await?,
    }))
}

/// POST /lock/release
///
/// Releasing a lock the caller does not hold answers `success: false`.
pub async fn release_lock(State(state): State<AppState>, Caller(who): Caller) -> HandlerResult<LockResponse> {
    let released = state.lock.release(&who).await?;
    let message = if released {
        "lock released".to_string()
    } else {
        format!("{} does not hold the lock", who.username)
    };
    Ok(Json(LockResponse {
        success: released,
        message,
        lock: state.lock.status(Some(&who)).await?,
    }))
}

// =============================================================================
// Group schedules
// =============================================================================

/// GET /groups/{id}/schedules
pub async fn get_group_schedules(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<(HeaderMap, Json<ScheduleListResponse>), AppError> {
    let (schedules, revision) = state.engine.group_schedules(group_id).await?;
    Ok((
        revision_headers(revision),
        Json(ScheduleListResponse { group_id, revision, schedules }),
    ))
}

/// POST /groups/{id}/schedules/batch
pub async fn replace_group_schedules(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(group_id): Path<GroupId>,
    body: Result<Json<BatchReplaceRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<ScheduleListResponse>), AppError> {
    let Json(request) = body?;
    let _permit = state.lock.authorize(&who).await?;
    let (schedules, revision) = state
        .engine
        .replace_group_schedules(group_id, request.revision, request.schedule_list)
        .await?;
    Ok((
        revision_headers(revision),
        Json(ScheduleListResponse { group_id, revision, schedules }),
    ))
}

/// PUT /groups/{id}
pub async fn upsert_group(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(group_id): Path<GroupId>,
    body: Result<Json<Group>, JsonRejection>,
) -> HandlerResult<Group> {
    let Json(mut group) = body?;
    group.id = group_id;
    let _permit = state.lock.authorize(&who).await?;
    state.engine.upsert_group(group.clone()).await?;
    Ok(Json(group))
}

/// PUT /groups/{id}/status
pub async fn set_group_status(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(group_id): Path<GroupId>,
    body: Result<Json<GroupStatusRequest>, JsonRejection>,
) -> HandlerResult<GroupStatusResponse> {
    let Json(request) = body?;
    let _permit = state.lock.authorize(&who).await?;
    let removed = state.engine.set_group_status(group_id, request.status).await?;
    Ok(Json(GroupStatusResponse {
        group_id,
        status: request.status,
        removed_assignments: removed,
        revision: state.engine.revision_of(group_id).await,
    }))
}

/// PUT /locations/{id}
pub async fn upsert_location(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(location_id): Path<LocationId>,
    body: Result<Json<Location>, JsonRejection>,
) -> HandlerResult<Location> {
    let Json(mut location) = body?;
    location.id = location_id;
    let _permit = state.lock.authorize(&who).await?;
    state.engine.upsert_location(location.clone()).await?;
    Ok(Json(location))
}

// =============================================================================
// Activities (single assignments)
// =============================================================================

/// GET /activities?groupId=&startDate=&endDate=
pub async fn list_activities(
    State(state): State<AppState>,
    query: Result<Query<AssignmentFilter>, QueryRejection>,
) -> HandlerResult<AssignmentListResponse> {
    let Query(filter) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let assignments = state.engine.list_assignments(&filter).await?;
    let total = assignments.len();
    Ok(Json(AssignmentListResponse { assignments, total }))
}

/// POST /activities
pub async fn create_activity(
    State(state): State<AppState>,
    Caller(who): Caller,
    body: Result<Json<AssignmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Assignment>), AppError> {
    let Json(request) = body?;
    let _permit = state.lock.authorize(&who).await?;
    let assignment = state
        .engine
        .create_assignment(request.input, request.ignore_conflicts)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// PUT /activities/{id}
pub async fn update_activity(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(raw_id): Path<String>,
    body: Result<Json<AssignmentRequest>, JsonRejection>,
) -> HandlerResult<Assignment> {
    let id = parse_ulid(&raw_id)?;
    let Json(request) = body?;
    let _permit = state.lock.authorize(&who).await?;
    let assignment = state
        .engine
        .update_assignment(id, request.input, request.ignore_conflicts)
        .await?;
    Ok(Json(assignment))
}

/// DELETE /activities/{id}
pub async fn delete_activity(
    State(state): State<AppState>,
    Caller(who): Caller,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_ulid(&raw_id)?;
    let _permit = state.lock.authorize(&who).await?;
    state.engine.delete_assignment(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Planning: export / import / allocate
// =============================================================================

/// POST /planning/export
///
/// Answers the snapshot as a JSON attachment.
pub async fn export_plan(
    State(state): State<AppState>,
    body: Result<Json<ExportRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<Snapshot>), AppError> {
    let Json(request) = body?;
    let snapshot = transfer::export(&state.engine, &request).await?;
    let mut headers = HeaderMap::new();
    let disposition = format!("attachment; filename=\"snapshot-{}.json\"", snapshot.metadata.id);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok((headers, Json(snapshot)))
}

/// POST /planning/import
pub async fn import_plan(
    State(state): State<AppState>,
    Caller(who): Caller,
    body: Result<Json<ImportRequest>, JsonRejection>,
) -> HandlerResult<ImportReport> {
    let Json(request) = body?;
    // A dry run writes nothing and needs no lock.
    let _permit = if request.options.dry_run {
        None
    } else {
        Some(state.lock.authorize(&who).await?)
    };
    let report = transfer::import(&state.engine, &request.payload, &request.options).await?;
    Ok(Json(report))
}

/// POST /planning/allocate
pub async fn allocate_plan(
    State(state): State<AppState>,
    Caller(who): Caller,
    body: Result<Json<AllocateRequest>, JsonRejection>,
) -> HandlerResult<AllocateReport> {
    let Json(request) = body?;
    let _permit = if request.apply {
        Some(state.lock.authorize(&who).await?)
    } else {
        None
    };
    let report = transfer::run_allocation(&state.engine, &request).await?;
    Ok(Json(report))
}

// =============================================================================
// Solver preview runs
// =============================================================================

/// POST /solver-preview-runs
pub async fn create_solver_run(
    State(state): State<AppState>,
    Caller(_who): Caller,
    body: Result<Json<SolverRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SolverRunCreated>), AppError> {
    let Json(request) = body?;
    let run_id = state.solver.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SolverRunCreated { run_id })))
}

/// GET /solver-preview-runs/{id}
pub async fn get_solver_run(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> HandlerResult<SolverRunResponse> {
    let id = parse_ulid(&raw_id)?;
    let run = state
        .engine
        .run(id)
        .await
        .ok_or_else(|| crate::engine::EngineError::not_found("solver run", id))?;
    Ok(Json(run.into()))
}
