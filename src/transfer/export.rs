use std::collections::BTreeSet;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, PlanState};
use crate::limits::*;
use crate::model::*;
use crate::planner::constraint;

use super::snapshot::*;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub all_items_mandatory: bool,
}

/// A selected group that cannot be planned downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportIssue {
    pub group_id: GroupId,
    pub group_name: String,
    pub message: String,
}

pub(crate) fn checked_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    let range = DateRange::new(start, end)
        .ok_or_else(|| EngineError::structural("startDate is after endDate"))?;
    if range.len_days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    Ok(range)
}

/// Build a snapshot of `request`'s window. Fails with `ExportValidation` when
/// any selected group has no must-visit location.
pub fn build_snapshot(state: &PlanState, slots: &SlotDefinitions, request: &ExportRequest) -> Result<Snapshot, EngineError> {
    let range = checked_range(request.start_date, request.end_date)?;
    if request.group_ids.is_empty() {
        return Err(EngineError::structural("groupIds must not be empty"));
    }
    if request.group_ids.len() > MAX_SELECTED_GROUPS {
        return Err(EngineError::LimitExceeded("too many groups selected"));
    }

    let requested: BTreeSet<GroupId> = request.group_ids.iter().copied().collect();
    let missing: Vec<String> = requested
        .iter()
        .filter(|id| !state.groups.contains_key(id))
        .map(|id| format!("group {id}"))
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Referential(missing));
    }

    let selected: Vec<&Group> = requested
        .iter()
        .filter_map(|id| state.groups.get(id))
        .filter(|g| !g.is_cancelled() && g.range().intersects(&range))
        .collect();
    if selected.is_empty() {
        return Err(EngineError::structural(
            "no selected group is active within the date range",
        ));
    }

    let issues: Vec<ExportIssue> = selected
        .iter()
        .filter(|g| g.must_visit.is_empty())
        .map(|g| ExportIssue {
            group_id: g.id,
            group_name: g.name.clone(),
            message: format!("group \"{}\" has no must-visit location", g.name),
        })
        .collect();
    if !issues.is_empty() {
        return Err(EngineError::ExportValidation(issues));
    }

    let required: BTreeSet<LocationId> = selected.iter().flat_map(|g| g.must_visit.iter().copied()).collect();
    let mut locations: Vec<Location> = state
        .locations
        .values()
        .filter(|l| {
            required.contains(&l.id)
                || (l.active && selected.iter().any(|g| constraint::matches_type(l, g)))
        })
        .cloned()
        .collect();
    locations.sort_by_key(|l| l.id);

    let group_ids: Vec<GroupId> = selected.iter().map(|g| g.id).collect();
    let required_locations = selected
        .iter()
        .map(|g| RequiredLocations { group_id: g.id, location_ids: g.must_visit.clone() })
        .collect();

    // Usage of every group in the window, so downstream planning sees what is taken.
    let mut assignments: Vec<Assignment> = state
        .assignments
        .values()
        .filter(|a| range.contains(a.date))
        .cloned()
        .collect();
    assignments.sort_by_key(|a| (a.date, a.slot, a.group_id, a.location_id, a.id));

    let mut schedules: Vec<Schedule> = state
        .schedules
        .values()
        .filter(|s| range.contains(s.date) && group_ids.contains(&s.group_id))
        .cloned()
        .collect();
    schedules.sort_by_key(|s| (s.group_id, s.date, s.start, s.id));

    Ok(Snapshot {
        schema: SNAPSHOT_SCHEMA.to_string(),
        metadata: SnapshotMetadata { id: Ulid::new(), generated_at: Utc::now() },
        scope: SnapshotScope {
            start_date: range.start,
            end_date: range.end,
            group_ids,
        },
        rules: SnapshotRules {
            slots: slots.to_list(),
            all_items_mandatory: request.all_items_mandatory,
        },
        data: SnapshotData {
            groups: selected.into_iter().cloned().collect(),
            locations,
            required_locations,
            assignments,
            schedules,
        },
    })
}

pub async fn export(engine: &Engine, request: &ExportRequest) -> Result<Snapshot, EngineError> {
    let state = engine.read().await;
    let snapshot = build_snapshot(&state, &engine.slots, request)?;
    info!(
        "exported snapshot {}: {} groups, {} locations, {} assignments",
        snapshot.metadata.id,
        snapshot.data.groups.len(),
        snapshot.data.locations.len(),
        snapshot.data.assignments.len()
    );
    Ok(snapshot)
}
