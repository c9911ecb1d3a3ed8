//! Application state for the HTTP server.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;
use crate::lock::EditLock;
use crate::solver::SolverQueue;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub lock: Arc<EditLock>,
    pub solver: Arc<SolverQueue>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the edit lock to the engine's durable lock record.
    pub fn new(engine: Arc<Engine>, solver: Arc<SolverQueue>, config: Config) -> Self {
        let lock = EditLock::new(
            engine.clone(),
            config.lock_ttl_ms(),
            config.automation_user.clone(),
        );
        Self {
            engine,
            lock: Arc::new(lock),
            solver,
            config: Arc::new(config),
        }
    }
}
