mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::{AssignmentInput, ScheduleInput};
pub(crate) use mutations::mirrored;
pub use queries::AssignmentFilter;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_RETAINED_RUNS;
use crate::model::*;
use crate::planner::CapacityTracker;
use crate::wal::{Txn, Wal};

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        txn: Txn,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Txn,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => batch.push((txn, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Txn, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Txn, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Plan state ───────────────────────────────────────────

/// Everything the store knows. Mutated only by `apply`, under the engine's
/// write guard, after the transaction is durable.
#[derive(Debug, Default)]
pub struct PlanState {
    pub groups: HashMap<GroupId, Group>,
    pub locations: HashMap<LocationId, Location>,
    pub assignments: HashMap<Ulid, Assignment>,
    pub schedules: HashMap<Ulid, Schedule>,
    pub revisions: HashMap<GroupId, u64>,
    pub lock: Option<LockRecord>,
    pub runs: HashMap<Ulid, RunRecord>,
}

impl PlanState {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::GroupUpserted(group) => {
                self.groups.insert(group.id, group.clone());
            }
            Event::GroupStatusChanged { id, status } => {
                if let Some(g) = self.groups.get_mut(id) {
                    g.status = *status;
                }
            }
            Event::LocationUpserted(location) => {
                self.locations.insert(location.id, location.clone());
            }
            Event::AssignmentAdded(a) => {
                self.assignments.insert(a.id, a.clone());
            }
            Event::AssignmentRemoved { id } => {
                self.assignments.remove(id);
            }
            Event::ScheduleAdded(s) => {
                self.schedules.insert(s.id, s.clone());
            }
            Event::ScheduleRemoved { id } => {
                self.schedules.remove(id);
            }
            Event::RevisionSet { group_id, revision } => {
                self.revisions.insert(*group_id, *revision);
            }
            Event::LockSet(record) => {
                self.lock = record.clone();
            }
            Event::RunRecorded(run) => {
                self.runs.insert(run.id, run.clone());
                if run.status.is_terminal() {
                    self.prune_runs();
                }
            }
        }
    }

    /// Drop the oldest finished runs beyond `MAX_RETAINED_RUNS`. Ulids sort by
    /// creation time. Unfinished runs are never dropped.
    fn prune_runs(&mut self) {
        let mut finished: Vec<Ulid> = self
            .runs
            .values()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.id)
            .collect();
        if finished.len() <= MAX_RETAINED_RUNS {
            return;
        }
        finished.sort_unstable();
        for id in &finished[..finished.len() - MAX_RETAINED_RUNS] {
            self.runs.remove(id);
        }
    }

    pub fn revision(&self, group_id: GroupId) -> u64 {
        self.revisions.get(&group_id).copied().unwrap_or(0)
    }

    /// `RevisionSet` events moving each touched group forward by one.
    pub(crate) fn bump_events(&self, groups: impl IntoIterator<Item = GroupId>) -> Vec<Event> {
        let mut ids: Vec<GroupId> = groups.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .map(|group_id| Event::RevisionSet {
                group_id,
                revision: self.revision(group_id) + 1,
            })
            .collect()
    }

    /// Events that recreate this state from nothing, as one transaction.
    pub fn snapshot_events(&self) -> Txn {
        let mut events = Vec::new();
        events.extend(self.groups.values().cloned().map(Event::GroupUpserted));
        events.extend(self.locations.values().cloned().map(Event::LocationUpserted));
        events.extend(self.assignments.values().cloned().map(Event::AssignmentAdded));
        events.extend(self.schedules.values().cloned().map(Event::ScheduleAdded));
        events.extend(
            self.revisions
                .iter()
                .map(|(&group_id, &revision)| Event::RevisionSet { group_id, revision }),
        );
        if self.lock.is_some() {
            events.push(Event::LockSet(self.lock.clone()));
        }
        events.extend(self.runs.values().cloned().map(Event::RunRecorded));
        events
    }
}

// ── Engine ───────────────────────────────────────────────

/// The transactional plan store. Every check-then-write sequence runs under
/// one write guard; the WAL append happens before state changes.
pub struct Engine {
    pub(crate) state: RwLock<PlanState>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    pub slots: SlotDefinitions,
}

impl Engine {
    pub fn new(wal_path: PathBuf, slots: SlotDefinitions) -> io::Result<Self> {
        let txns = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = PlanState::default();
        for event in txns.iter().flatten() {
            state.apply(event);
        }
        info!(
            "replayed {} transactions: {} groups, {} locations, {} assignments",
            txns.len(),
            state.groups.len(),
            state.locations.len(),
            state.assignments.len()
        );

        let usage = CapacityTracker::seeded(state.assignments.values(), None, |_| false);
        for (date, slot, loc, used) in usage.overbooked(&state.locations) {
            warn!(
                "historical overbooking at {} ({}) {date} {slot}: {used} > {}",
                loc.name, loc.id, loc.capacity
            );
        }

        Ok(Self {
            state: RwLock::new(state),
            wal_tx,
            slots,
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, PlanState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, PlanState> {
        self.state.write().await
    }

    async fn wal_append(&self, txn: Txn) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { txn, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `txn` durable, then apply it. The caller holds the write guard for
    /// the whole check-and-commit sequence.
    pub(crate) async fn commit(&self, state: &mut PlanState, txn: Txn) -> Result<(), EngineError> {
        if txn.is_empty() {
            return Ok(());
        }
        self.wal_append(txn.clone()).await?;
        for event in &txn {
            state.apply(event);
        }
        Ok(())
    }

    /// Rewrite the WAL as a single transaction recreating the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold the read guard until the writer has the snapshot queued so no
        // later append can land before it.
        let guard = self.state.read().await;
        let snapshot = guard.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        drop(guard);
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
