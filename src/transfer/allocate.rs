use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{Engine, EngineError, PlanState};
use crate::limits::*;
use crate::model::*;
use crate::planner::{allocate, Allocation, AllocationInput, CapacityTracker, DuplicateGuard, PreferenceHint, ProposedAssignment, Unplaced};

use super::export::checked_range;
use super::import::{apply_rows, ImportOptions, ImportReport, ImportRow};
use super::snapshot::SnapshotScope;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    /// Defaults to every non-cancelled group active in the window.
    #[serde(default)]
    pub group_ids: Option<Vec<GroupId>>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub hints: Vec<PreferenceHint>,
    /// Write the candidates; otherwise the import step is a dry run.
    #[serde(default)]
    pub apply: bool,
    #[serde(default)]
    pub replace_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateReport {
    pub candidates: Vec<ProposedAssignment>,
    pub unplaced: Vec<Unplaced>,
    pub import: ImportReport,
}

fn selected_groups(state: &PlanState, ids: Option<&[GroupId]>, range: DateRange) -> Result<Vec<GroupId>, EngineError> {
    let mut out: Vec<GroupId> = match ids {
        Some(ids) => {
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !state.groups.contains_key(id))
                .map(|id| format!("group {id}"))
                .collect();
            if !missing.is_empty() {
                return Err(EngineError::Referential(missing));
            }
            ids.to_vec()
        }
        None => state.groups.keys().copied().collect(),
    };
    out.retain(|id| {
        state
            .groups
            .get(id)
            .is_some_and(|g| !g.is_cancelled() && g.range().intersects(&range))
    });
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Run the allocator against `state`. Usage of the selected groups inside the
/// window is ignored when `replace_existing` is set.
pub fn plan(
    state: &PlanState,
    slots: &SlotDefinitions,
    group_ids: &[GroupId],
    range: DateRange,
    hints: &[PreferenceHint],
    replace_existing: bool,
) -> Allocation {
    let replaced = |a: &Assignment| replace_existing && group_ids.contains(&a.group_id) && range.contains(a.date);
    let capacity = CapacityTracker::seeded(state.assignments.values(), Some(range), replaced);
    let booked = DuplicateGuard::seeded(state.assignments.values(), replaced);

    let mut visited: HashMap<GroupId, HashSet<LocationId>> = HashMap::new();
    for a in state.assignments.values().filter(|a| !replaced(a)) {
        if group_ids.contains(&a.group_id) {
            visited.entry(a.group_id).or_default().insert(a.location_id);
        }
    }

    let groups: Vec<&Group> = group_ids.iter().filter_map(|id| state.groups.get(id)).collect();
    let mut locations: Vec<&Location> = state.locations.values().collect();
    locations.sort_by_key(|l| l.id);

    allocate(&AllocationInput {
        groups,
        locations,
        range,
        slots: Slot::ALL.to_vec(),
        slot_defs: slots,
        hints,
        capacity: &capacity,
        booked: &booked,
        visited,
    })
}

/// Generate candidates and feed them through the import pipeline.
pub async fn run_allocation(engine: &Engine, request: &AllocateRequest) -> Result<AllocateReport, EngineError> {
    let range = checked_range(request.start_date, request.end_date)?;
    if request.hints.len() > MAX_HINTS {
        return Err(EngineError::LimitExceeded("too many preference hints"));
    }
    if request.group_ids.as_ref().is_some_and(|ids| ids.len() > MAX_SELECTED_GROUPS) {
        return Err(EngineError::LimitExceeded("too many groups selected"));
    }

    let (group_ids, allocation) = {
        let state = engine.read().await;
        let group_ids = selected_groups(&state, request.group_ids.as_deref(), range)?;
        let allocation = plan(&state, &engine.slots, &group_ids, range, &request.hints, request.replace_existing);
        (group_ids, allocation)
    };
    metrics::counter!(crate::observability::ALLOCATION_UNPLACED_TOTAL)
        .increment(allocation.unplaced.len() as u64);
    info!(
        "allocation over {} – {}: {} groups, {} candidates, {} unplaced",
        range.start,
        range.end,
        group_ids.len(),
        allocation.assignments.len(),
        allocation.unplaced.len()
    );

    // The store may have moved since the read guard was dropped; the import
    // step revalidates every candidate under the write guard.
    let scope = SnapshotScope {
        start_date: range.start,
        end_date: range.end,
        group_ids: group_ids.clone(),
    };
    let options = ImportOptions {
        replace_existing: request.replace_existing,
        skip_conflicts: true,
        dry_run: !request.apply,
        group_ids: Some(group_ids),
    };
    let rows: Vec<ImportRow> = allocation.assignments.iter().copied().map(ImportRow::from).collect();
    let import = apply_rows(engine, rows, Some(&scope), &options).await?;

    Ok(AllocateReport {
        candidates: allocation.assignments,
        unplaced: allocation.unplaced,
        import,
    })
}
