//! Data Transfer Objects for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::engine::{AssignmentInput, ScheduleInput};
use crate::lock::LockStatus;
use crate::model::*;
use crate::transfer::{ImportOptions, ImportPayload};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub groups: usize,
    pub locations: usize,
    pub assignments: usize,
    pub solver_backend: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLockRequest {
    /// Pre-empt another holder (automation user only).
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub success: bool,
    pub message: String,
    pub lock: LockStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleListResponse {
    pub group_id: GroupId,
    pub revision: u64,
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReplaceRequest {
    pub schedule_list: Vec<ScheduleInput>,
    pub revision: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    #[serde(flatten)]
    pub input: AssignmentInput,
    /// Bypass soft (capacity) conflicts. Hard conflicts still reject.
    #[serde(default)]
    pub ignore_conflicts: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentListResponse {
    pub assignments: Vec<Assignment>,
    pub total: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatusRequest {
    pub status: GroupStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatusResponse {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub removed_assignments: usize,
    pub revision: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub payload: ImportPayload,
    #[serde(default)]
    pub options: ImportOptions,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverRunCreated {
    pub run_id: Ulid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverRunResponse {
    pub run_id: Ulid,
    pub status: RunStatus,
    pub backend: String,
    pub error: Option<String>,
    pub log_tail: String,
    pub candidates_summary: Option<CandidatesSummary>,
    pub created_at: Ms,
    pub started_at: Option<Ms>,
    pub finished_at: Option<Ms>,
    pub result: Option<Value>,
}

impl From<RunRecord> for SolverRunResponse {
    fn from(run: RunRecord) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            backend: run.backend,
            error: run.error,
            log_tail: run.log_tail,
            candidates_summary: run.summary,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
            result: run.result.and_then(|r| serde_json::from_str(&r).ok()),
        }
    }
}
