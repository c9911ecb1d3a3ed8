use std::path::PathBuf;
use std::time::Duration;

use crate::model::Ms;
use crate::solver::SolverBackend;

/// Server settings read from `TOURSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub lock_ttl: Duration,
    pub automation_user: String,
    pub solver_cmd: Option<String>,
    pub solver_args: Vec<String>,
    pub solver_timeout: Duration,
    pub log_tail_bytes: usize,
    /// Include internal error details in 500 responses.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let flag = |key: &str| {
            lookup(key).is_some_and(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        };

        Self {
            bind: lookup("TOURSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("TOURSLOT_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(8080),
            data_dir: PathBuf::from(lookup("TOURSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            compact_threshold: parsed("TOURSLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed("TOURSLOT_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            lock_ttl: Duration::from_secs(parsed("TOURSLOT_LOCK_TTL_SECS").unwrap_or(300)),
            automation_user: lookup("TOURSLOT_AUTOMATION_USER").unwrap_or_else(|| "automation".into()),
            solver_cmd: lookup("TOURSLOT_SOLVER_CMD").filter(|s| !s.trim().is_empty()),
            solver_args: lookup("TOURSLOT_SOLVER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            solver_timeout: Duration::from_secs(parsed("TOURSLOT_SOLVER_TIMEOUT_SECS").unwrap_or(120)),
            log_tail_bytes: parsed("TOURSLOT_LOG_TAIL_BYTES").map_or(4096, |n| n as usize),
            dev_mode: flag("TOURSLOT_DEV_MODE"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("plan.wal")
    }

    pub fn lock_ttl_ms(&self) -> Ms {
        self.lock_ttl.as_millis() as Ms
    }

    pub fn solver_backend(&self) -> SolverBackend {
        match &self.solver_cmd {
            Some(program) => SolverBackend::External {
                program: program.clone(),
                args: self.solver_args.clone(),
                timeout: self.solver_timeout,
                log_tail_bytes: self.log_tail_bytes,
            },
            None => SolverBackend::Builtin,
        }
    }
}
