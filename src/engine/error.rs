use crate::model::Ms;
use crate::planner::ConflictList;
use crate::transfer::{ExportIssue, RowConflict};

#[derive(Debug)]
pub enum EngineError {
    NotFound { entity: &'static str, id: String },
    /// Malformed or missing fields; nothing was applied.
    Structural(Vec<String>),
    /// Unknown group/location ids referenced by a batch.
    Referential(Vec<String>),
    SchemaMismatch { expected: String, found: String },
    LockHeld { holder: String, expires_at: Ms },
    NotLockHolder,
    Forbidden(String),
    RevisionConflict { current: u64 },
    Conflicts(ConflictList),
    ImportConflicts(Vec<RowConflict>),
    ExportValidation(Vec<ExportIssue>),
    QueueFull,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound { entity, id: id.to_string() }
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        EngineError::Structural(vec![msg.into()])
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::Structural(errors) => write!(f, "invalid request: {}", errors.join("; ")),
            EngineError::Referential(missing) => {
                write!(f, "unknown references: {}", missing.join(", "))
            }
            EngineError::SchemaMismatch { expected, found } => {
                write!(f, "unsupported schema {found:?}, expected {expected:?}")
            }
            EngineError::LockHeld { holder, expires_at } => {
                write!(f, "plan is being edited by {holder} until {expires_at}")
            }
            EngineError::NotLockHolder => write!(f, "edit lock is not held by caller"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::RevisionConflict { current } => {
                write!(f, "schedule revision is stale; current revision is {current}")
            }
            EngineError::Conflicts(list) => write!(f, "{} scheduling conflict(s)", list.len()),
            EngineError::ImportConflicts(rows) => {
                write!(f, "{} import row(s) conflict; nothing was applied", rows.len())
            }
            EngineError::ExportValidation(issues) => {
                write!(f, "{} group(s) cannot be exported", issues.len())
            }
            EngineError::QueueFull => write!(f, "solver queue is full"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
