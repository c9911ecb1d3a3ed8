use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_QUEUED_RUNS;
use crate::model::*;
use crate::planner::{PreferenceHint, ProposedAssignment};
use crate::transfer::export::checked_range;
use crate::transfer::import::normalize_row;
use crate::transfer::{build_snapshot, plan, ExportRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverRequest {
    #[serde(default)]
    pub group_ids: Option<Vec<GroupId>>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub hints: Vec<PreferenceHint>,
}

#[derive(Debug, Clone)]
pub enum SolverBackend {
    /// The in-process greedy allocator.
    Builtin,
    /// An external program: snapshot JSON on stdin, `{"assignments": [...]}` on stdout.
    External {
        program: String,
        args: Vec<String>,
        timeout: Duration,
        log_tail_bytes: usize,
    },
}

impl SolverBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SolverBackend::Builtin => "builtin",
            SolverBackend::External { .. } => "external",
        }
    }
}

/// What a finished run produced.
struct RunOutcome {
    result: Value,
    summary: CandidatesSummary,
    log_tail: String,
}

struct RunFailure {
    error: String,
    log_tail: String,
}

impl RunFailure {
    fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), log_tail: String::new() }
    }
}

fn summarize(candidates: &[ProposedAssignment], unplaced: usize) -> CandidatesSummary {
    CandidatesSummary {
        assignments: candidates.len(),
        groups: candidates.iter().map(|c| c.group_id).collect::<BTreeSet<_>>().len(),
        locations: candidates.iter().map(|c| c.location_id).collect::<BTreeSet<_>>().len(),
        unplaced,
    }
}

/// Last `max` bytes of `bytes` as text, cut on a character boundary.
pub fn log_tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

pub struct SolverQueue {
    engine: Arc<Engine>,
    backend: SolverBackend,
    tx: mpsc::UnboundedSender<Ulid>,
    /// Runs accepted but not finished, with their current status.
    live: DashMap<Ulid, RunStatus>,
}

impl SolverQueue {
    /// Mark leftovers from a previous process as lost, then spawn the worker.
    pub async fn start(engine: Arc<Engine>, backend: SolverBackend) -> Result<Arc<Self>, EngineError> {
        let lost = engine.mark_lost_runs().await?;
        if !lost.is_empty() {
            warn!("{} solver runs were lost by a restart", lost.len());
            metrics::counter!(crate::observability::SOLVER_RUNS_TOTAL, "status" => "lost")
                .increment(lost.len() as u64);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self { engine, backend, tx, live: DashMap::new() });
        tokio::spawn(Arc::clone(&queue).run_worker(rx));
        info!("solver queue started with {} backend", queue.backend.name());
        Ok(queue)
    }

    pub fn backend(&self) -> &SolverBackend {
        &self.backend
    }

    pub async fn submit(&self, request: SolverRequest) -> Result<Ulid, EngineError> {
        checked_range(request.start_date, request.end_date)?;
        if self.live.len() >= MAX_QUEUED_RUNS {
            return Err(EngineError::QueueFull);
        }
        let request_json = serde_json::to_string(&request)
            .map_err(|e| EngineError::structural(format!("unserializable solver request: {e}")))?;

        let id = Ulid::new();
        let record = RunRecord {
            id,
            status: RunStatus::Queued,
            backend: self.backend.name().to_string(),
            request: request_json,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            error: None,
            log_tail: String::new(),
            result: None,
            summary: None,
        };
        self.engine.record_run(record).await?;
        self.live.insert(id, RunStatus::Queued);
        metrics::gauge!(crate::observability::SOLVER_QUEUE_DEPTH).set(self.live.len() as f64);

        if self.tx.send(id).is_err() {
            self.live.remove(&id);
            return Err(EngineError::WalError("solver worker is not running".into()));
        }
        debug!("solver run {id} queued");
        Ok(id)
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Ulid>) {
        while let Some(id) = rx.recv().await {
            if let Err(e) = self.process(id).await {
                error!("solver run {id} could not be recorded: {e}");
            }
            self.live.remove(&id);
            metrics::gauge!(crate::observability::SOLVER_QUEUE_DEPTH).set(self.live.len() as f64);
        }
    }

    async fn process(&self, id: Ulid) -> Result<(), EngineError> {
        let Some(mut record) = self.engine.run(id).await else {
            return Err(EngineError::not_found("solver run", id));
        };
        record.status = RunStatus::Running;
        record.started_at = Some(now_ms());
        self.engine.record_run(record.clone()).await?;
        self.live.insert(id, RunStatus::Running);
        info!("solver run {id} started ({})", record.backend);

        let outcome = match serde_json::from_str::<SolverRequest>(&record.request) {
            Ok(request) => self.execute(&request).await,
            Err(e) => Err(RunFailure::new(format!("stored request is unreadable: {e}"))),
        };

        record.finished_at = Some(now_ms());
        match outcome {
            Ok(done) => {
                record.status = RunStatus::Succeeded;
                record.log_tail = done.log_tail;
                record.result = Some(done.result.to_string());
                info!(
                    "solver run {id} succeeded: {} candidates, {} unplaced",
                    done.summary.assignments, done.summary.unplaced
                );
                record.summary = Some(done.summary);
            }
            Err(failure) => {
                warn!("solver run {id} failed: {}", failure.error);
                record.status = RunStatus::Failed;
                record.error = Some(failure.error);
                record.log_tail = failure.log_tail;
            }
        }
        let status = if record.status == RunStatus::Succeeded { "succeeded" } else { "failed" };
        metrics::counter!(crate::observability::SOLVER_RUNS_TOTAL, "status" => status).increment(1);
        self.engine.record_run(record).await
    }

    async fn execute(&self, request: &SolverRequest) -> Result<RunOutcome, RunFailure> {
        let range = checked_range(request.start_date, request.end_date)
            .map_err(|e| RunFailure::new(e.to_string()))?;
        match &self.backend {
            SolverBackend::Builtin => {
                let state = self.engine.read().await;
                let group_ids: Vec<GroupId> = match &request.group_ids {
                    Some(ids) => ids.clone(),
                    None => {
                        let mut ids: Vec<GroupId> = state.groups.keys().copied().collect();
                        ids.sort_unstable();
                        ids
                    }
                };
                let allocation = plan(&state, &self.engine.slots, &group_ids, range, &request.hints, true);
                drop(state);

                let summary = summarize(&allocation.assignments, allocation.unplaced.len());
                let log_tail = format!(
                    "builtin allocator: {} candidates, {} unplaced\n",
                    summary.assignments, summary.unplaced
                );
                let result = serde_json::json!({
                    "assignments": allocation.assignments,
                    "unplaced": allocation.unplaced,
                });
                Ok(RunOutcome { result, summary, log_tail })
            }
            SolverBackend::External { program, args, timeout, log_tail_bytes } => {
                let export = ExportRequest {
                    group_ids: request.group_ids.clone().unwrap_or_default(),
                    start_date: range.start,
                    end_date: range.end,
                    all_items_mandatory: false,
                };
                let (input, participants) = {
                    let state = self.engine.read().await;
                    let snapshot = build_snapshot(&state, &self.engine.slots, &export)
                        .map_err(|e| RunFailure::new(format!("cannot build solver input: {e}")))?;
                    let participants: std::collections::HashMap<GroupId, u32> = snapshot
                        .data
                        .groups
                        .iter()
                        .map(|g| (g.id, g.participant_count()))
                        .collect();
                    let input = serde_json::to_vec(&snapshot)
                        .map_err(|e| RunFailure::new(format!("cannot encode solver input: {e}")))?;
                    (input, participants)
                };

                let output = run_external(program, args, input, *timeout, *log_tail_bytes).await?;
                let tail = output.log_tail;
                if !output.status.success() {
                    return Err(RunFailure {
                        error: format!("solver exited with {}", output.status),
                        log_tail: tail,
                    });
                }

                let parsed: ExternalOutput = serde_json::from_slice(&output.stdout).map_err(|e| RunFailure {
                    error: format!("solver output is not valid JSON: {e}"),
                    log_tail: tail.clone(),
                })?;
                let mut candidates = Vec::with_capacity(parsed.assignments.len());
                for (index, raw) in parsed.assignments.iter().enumerate() {
                    let row = normalize_row(raw).map_err(|errs| RunFailure {
                        error: format!("solver row {index}: {}", errs.join("; ")),
                        log_tail: tail.clone(),
                    })?;
                    candidates.push(ProposedAssignment {
                        group_id: row.group_id,
                        location_id: row.location_id,
                        date: row.date,
                        slot: row.slot,
                        participant_count: row
                            .participant_count
                            .or_else(|| participants.get(&row.group_id).copied())
                            .unwrap_or(0),
                    });
                }

                let summary = summarize(&candidates, 0);
                let result = serde_json::json!({ "assignments": candidates });
                Ok(RunOutcome { result, summary, log_tail: tail })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExternalOutput {
    #[serde(default)]
    assignments: Vec<Value>,
}

struct ExternalRun {
    status: std::process::ExitStatus,
    stdout: Vec<u8>,
    log_tail: String,
}

/// Append `bytes`, keeping roughly the last `max` bytes.
fn keep_tail(buf: &mut Vec<u8>, bytes: &[u8], max: usize) {
    buf.extend_from_slice(bytes);
    if buf.len() > max.saturating_mul(2) {
        let cut = buf.len() - max;
        buf.drain(..cut);
    }
}

/// Spawn `program`, feed `input` on stdin and wait at most `timeout`. Stderr is
/// collected as it arrives so a killed child still leaves its log tail.
async fn run_external(
    program: &str,
    args: &[String],
    input: Vec<u8>,
    timeout: Duration,
    tail_bytes: usize,
) -> Result<ExternalRun, RunFailure> {
    let deadline = tokio::time::Instant::now() + timeout;
    let timed_out = |stderr: &[u8]| RunFailure {
        error: format!("solver timed out after {}s and was killed", timeout.as_secs()),
        log_tail: log_tail(stderr, tail_bytes),
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunFailure::new(format!("cannot start solver {program:?}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!("solver stdin closed early: {e}");
            }
        });
    }
    let stdout_task = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = out.read_to_end(&mut buf).await {
                debug!("solver stdout read failed: {e}");
            }
            buf
        })
    });
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Some(mut err) = child.stderr.take() {
        tokio::spawn(async move {
            let mut chunk = vec![0u8; 4096];
            loop {
                match err.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if err_tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let mut stderr = Vec::new();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(bytes) = err_rx.recv() => keep_tail(&mut stderr, &bytes, tail_bytes),
            _ = tokio::time::sleep_until(deadline) => {
                if let Err(e) = child.kill().await {
                    warn!("cannot kill timed out solver: {e}");
                }
                // Chunks already read before the kill.
                let _ = tokio::time::timeout(Duration::from_millis(50), async {
                    while let Some(bytes) = err_rx.recv().await {
                        keep_tail(&mut stderr, &bytes, tail_bytes);
                    }
                })
                .await;
                return Err(timed_out(&stderr));
            }
        }
    };
    let status = status.map_err(|e| RunFailure::new(format!("solver i/o error: {e}")))?;

    // Pipes may outlive the child when it left descendants behind.
    let drained = tokio::time::timeout_at(deadline, async {
        while let Some(bytes) = err_rx.recv().await {
            keep_tail(&mut stderr, &bytes, tail_bytes);
        }
    })
    .await;
    if drained.is_err() {
        return Err(timed_out(&stderr));
    }
    let stdout = match stdout_task {
        Some(task) => match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(RunFailure::new(format!("solver stdout reader failed: {e}"))),
            Err(_) => return Err(timed_out(&stderr)),
        },
        None => Vec::new(),
    };
    Ok(ExternalRun { status, stdout, log_tail: log_tail(&stderr, tail_bytes) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tourslot_test_solver");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    async fn seeded_engine(name: &str) -> Arc<Engine> {
        let engine = Arc::new(Engine::new(test_wal_path(name), SlotDefinitions::default()).unwrap());
        engine
            .upsert_location(Location {
                id: 10,
                name: "Museum".into(),
                capacity: 60,
                blocked_weekdays: WeekdaySet::empty(),
                closed_dates: Default::default(),
                open_hours: Default::default(),
                target_groups: TargetGroups::All,
                active: true,
            })
            .await
            .unwrap();
        engine
            .upsert_group(Group {
                id: 1,
                name: "Class 5A".into(),
                group_type: GroupType::Primary,
                start_date: d("2025-07-01"),
                end_date: d("2025-07-01"),
                student_count: 30,
                teacher_count: 2,
                itinerary_plan_id: None,
                must_visit: vec![10],
                status: GroupStatus::Preparing,
            })
            .await
            .unwrap();
        engine
    }

    fn request() -> SolverRequest {
        SolverRequest {
            group_ids: Some(vec![1]),
            start_date: d("2025-07-01"),
            end_date: d("2025-07-01"),
            hints: vec![],
        }
    }

    async fn wait_terminal(engine: &Engine, id: Ulid) -> RunRecord {
        for _ in 0..200 {
            if let Some(run) = engine.run(id).await
                && run.status.is_terminal()
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {id} did not finish");
    }

    fn external(script: &str, timeout: Duration) -> SolverBackend {
        SolverBackend::External {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout,
            log_tail_bytes: 64,
        }
    }

    #[test]
    fn keep_tail_bounds_the_buffer() {
        let mut buf = Vec::new();
        for _ in 0..100 {
            keep_tail(&mut buf, b"0123456789", 16);
        }
        assert!(buf.len() <= 32);
        assert_eq!(log_tail(&buf, 4), "6789");
    }

    #[test]
    fn log_tail_keeps_the_end() {
        assert_eq!(log_tail(b"hello", 10), "hello");
        assert_eq!(log_tail(b"0123456789", 4), "6789");
        // Multi-byte char straddling the cut is dropped, not split.
        let s = "aé".as_bytes();
        assert_eq!(log_tail(s, 1), "");
    }

    #[tokio::test]
    async fn builtin_run_succeeds_with_summary() {
        let engine = seeded_engine("builtin_run.wal").await;
        let queue = SolverQueue::start(engine.clone(), SolverBackend::Builtin).await.unwrap();
        let id = queue.submit(request()).await.unwrap();

        let run = wait_terminal(&engine, id).await;
        assert_eq!(run.status, RunStatus::Succeeded);
        let summary = run.summary.unwrap();
        // One group, one day, three slots.
        assert_eq!(summary.assignments, 3);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.unplaced, 0);
        assert!(run.started_at.is_some() && run.finished_at.is_some());
    }

    #[tokio::test]
    async fn external_run_parses_stdout() {
        let engine = seeded_engine("external_ok.wal").await;
        let script = r#"cat >/dev/null; echo '{"assignments":[{"groupId":1,"locationId":10,"date":"2025-07-01","timeSlot":"MORNING"}]}'; echo done >&2"#;
        let queue = SolverQueue::start(engine.clone(), external(script, Duration::from_secs(10)))
            .await
            .unwrap();
        let id = queue.submit(request()).await.unwrap();

        let run = wait_terminal(&engine, id).await;
        assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.error);
        assert_eq!(run.summary.unwrap().assignments, 1);
        assert_eq!(run.log_tail.trim(), "done");
        let result: Value = serde_json::from_str(run.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["assignments"][0]["participantCount"], 32);
    }

    #[tokio::test]
    async fn external_failure_is_recorded_not_thrown() {
        let engine = seeded_engine("external_fail.wal").await;
        let queue = SolverQueue::start(engine.clone(), external("echo boom >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();
        let id = queue.submit(request()).await.unwrap();

        let run = wait_terminal(&engine, id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("exited"));
        assert_eq!(run.log_tail.trim(), "boom");
    }

    #[tokio::test]
    async fn external_timeout_kills_the_process() {
        let engine = seeded_engine("external_timeout.wal").await;
        let queue = SolverQueue::start(
            engine.clone(),
            external("echo partial >&2; sleep 30", Duration::from_millis(300)),
        )
        .await
        .unwrap();
        let id = queue.submit(request()).await.unwrap();

        let run = wait_terminal(&engine, id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("timed out"));
        assert!(run.log_tail.contains("partial"), "log tail was {:?}", run.log_tail);
    }

    #[tokio::test]
    async fn unfinished_runs_are_lost_after_restart() {
        let path = test_wal_path("lost_runs.wal");
        let engine = Arc::new(Engine::new(path.clone(), SlotDefinitions::default()).unwrap());
        let id = Ulid::new();
        engine
            .record_run(RunRecord {
                id,
                status: RunStatus::Running,
                backend: "builtin".into(),
                request: "{}".into(),
                created_at: 1,
                started_at: Some(2),
                finished_at: None,
                error: None,
                log_tail: String::new(),
                result: None,
                summary: None,
            })
            .await
            .unwrap();
        drop(engine);

        let engine = Arc::new(Engine::new(path, SlotDefinitions::default()).unwrap());
        let _queue = SolverQueue::start(engine.clone(), SolverBackend::Builtin).await.unwrap();
        let run = engine.run(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Lost);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn invalid_range_is_rejected_on_submit() {
        let engine = seeded_engine("bad_range.wal").await;
        let queue = SolverQueue::start(engine, SolverBackend::Builtin).await.unwrap();
        let mut req = request();
        req.start_date = d("2025-07-05");
        assert!(matches!(queue.submit(req).await, Err(EngineError::Structural(_))));
    }
}
