use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::{mirrored, Engine, EngineError, PlanState};
use crate::limits::*;
use crate::model::*;
use crate::planner::{validate, CapacityTracker, Conflict, DuplicateGuard, ProposedAssignment, ValidationContext};

use super::snapshot::{SnapshotScope, SNAPSHOT_SCHEMA};

/// Snapshot-shaped import body. Only `schema`, `scope` and the assignment
/// rows are read; rows stay untyped until normalized so every malformed row
/// can be reported by index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPayload {
    pub schema: String,
    #[serde(default)]
    pub scope: Option<SnapshotScope>,
    #[serde(default)]
    pub data: ImportData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportData {
    #[serde(default)]
    pub assignments: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    #[serde(default)]
    pub replace_existing: bool,
    #[serde(default)]
    pub skip_conflicts: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Restricts the import to these groups; rows for other groups are malformed.
    #[serde(default)]
    pub group_ids: Option<Vec<GroupId>>,
}

/// A normalized row. `participant_count` is resolved from the group when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub group_id: GroupId,
    pub location_id: LocationId,
    pub date: NaiveDate,
    pub slot: Slot,
    pub participant_count: Option<u32>,
    pub tag: Option<String>,
}

impl From<ProposedAssignment> for ImportRow {
    fn from(p: ProposedAssignment) -> Self {
        Self {
            group_id: p.group_id,
            location_id: p.location_id,
            date: p.date,
            slot: p.slot,
            participant_count: Some(p.participant_count),
            tag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowConflict {
    pub index: usize,
    pub group_id: GroupId,
    pub location_id: LocationId,
    pub date: NaiveDate,
    #[serde(rename = "timeSlot")]
    pub slot: Slot,
    pub reasons: Vec<Conflict>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    /// Distinct groups referenced by the rows.
    pub groups: usize,
    /// Rows submitted.
    pub assignments: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub summary: ImportSummary,
    pub conflicts: Vec<RowConflict>,
    pub dry_run: bool,
    /// Assignments removed by `replaceExisting`.
    pub removed: usize,
    /// New revision of every touched group.
    pub revisions: BTreeMap<GroupId, u64>,
}

// ── Normalization ────────────────────────────────────────

fn field<'a>(row: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| row.get(*n)).filter(|v| !v.is_null())
}

fn positive_id(row: &Value, names: &[&str], label: &str) -> Result<i64, String> {
    let value = field(row, names).ok_or_else(|| format!("{label} is missing"))?;
    let id = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(format!("{label} must be a positive integer")),
    }
}

/// Normalize one raw row, collecting every problem it has.
pub fn normalize_row(row: &Value) -> Result<ImportRow, Vec<String>> {
    if !row.is_object() {
        return Err(vec!["row is not an object".into()]);
    }
    let mut errors = Vec::new();

    let group_id = positive_id(row, &["groupId", "group_id"], "groupId").map_err(|e| errors.push(e));
    let location_id =
        positive_id(row, &["locationId", "location_id"], "locationId").map_err(|e| errors.push(e));

    let date = match field(row, &["date", "activityDate", "activity_date"]) {
        Some(Value::String(s)) => s
            .trim()
            .parse::<NaiveDate>()
            .map_err(|_| errors.push(format!("date {s:?} is not YYYY-MM-DD"))),
        Some(_) => Err(errors.push("date must be a string".into())),
        None => Err(errors.push("date is missing".into())),
    };

    let slot = match field(row, &["timeSlot", "time_slot", "slot"]) {
        Some(Value::String(s)) => {
            Slot::parse(s).ok_or_else(|| errors.push(format!("unknown time slot {s:?}")))
        }
        Some(_) => Err(errors.push("timeSlot must be a string".into())),
        None => Err(errors.push("timeSlot is missing".into())),
    };

    let participant_count = match field(row, &["participantCount", "participant_count"]) {
        None => Ok(None),
        Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) if n > 0 && n <= MAX_PARTICIPANTS => Ok(Some(n)),
            _ => Err(errors.push(format!("participantCount must be between 1 and {MAX_PARTICIPANTS}"))),
        },
    };

    let tag = match field(row, &["tag"]) {
        None => Ok(None),
        Some(Value::String(s)) if s.len() <= MAX_TAG_LEN => Ok(Some(s.clone())),
        Some(_) => Err(errors.push("tag must be a short string".into())),
    };

    match (group_id, location_id, date, slot, participant_count, tag) {
        (Ok(group_id), Ok(location_id), Ok(date), Ok(slot), Ok(participant_count), Ok(tag)) => {
            Ok(ImportRow { group_id, location_id, date, slot, participant_count, tag })
        }
        _ => Err(errors),
    }
}

/// Normalize the whole payload; any malformed row rejects everything.
pub fn normalize_payload(payload: &ImportPayload, options: &ImportOptions) -> Result<Vec<ImportRow>, EngineError> {
    if payload.schema != SNAPSHOT_SCHEMA {
        return Err(EngineError::SchemaMismatch {
            expected: SNAPSHOT_SCHEMA.into(),
            found: payload.schema.clone(),
        });
    }
    if payload.data.assignments.len() > MAX_IMPORT_ROWS {
        return Err(EngineError::LimitExceeded("too many import rows"));
    }
    if let Some(scope) = &payload.scope
        && scope.range().is_none()
    {
        return Err(EngineError::structural("scope startDate is after endDate"));
    }

    let mut rows = Vec::with_capacity(payload.data.assignments.len());
    let mut errors = Vec::new();
    for (index, raw) in payload.data.assignments.iter().enumerate() {
        match normalize_row(raw) {
            Ok(row) => {
                if let Some(allowed) = &options.group_ids
                    && !allowed.contains(&row.group_id)
                {
                    errors.push(format!("row {index}: group {} is not selected for import", row.group_id));
                }
                rows.push(row);
            }
            Err(problems) => {
                errors.extend(problems.into_iter().map(|p| format!("row {index}: {p}")));
            }
        }
    }
    if !errors.is_empty() {
        return Err(EngineError::Structural(errors));
    }
    Ok(rows)
}

// ── Apply ────────────────────────────────────────────────

fn missing_references(state: &PlanState, rows: &[ImportRow]) -> Vec<String> {
    let groups: BTreeSet<GroupId> = rows
        .iter()
        .map(|r| r.group_id)
        .filter(|id| !state.groups.contains_key(id))
        .collect();
    let locations: BTreeSet<LocationId> = rows
        .iter()
        .map(|r| r.location_id)
        .filter(|id| !state.locations.contains_key(id))
        .collect();
    groups
        .into_iter()
        .map(|id| format!("group {id}"))
        .chain(locations.into_iter().map(|id| format!("location {id}")))
        .collect()
}

/// Window the replace deletes from: the scope if given, else the span of the rows.
fn replace_window(scope: Option<&SnapshotScope>, rows: &[ImportRow]) -> Option<DateRange> {
    if let Some(range) = scope.and_then(SnapshotScope::range) {
        return Some(range);
    }
    let start = rows.iter().map(|r| r.date).min()?;
    let end = rows.iter().map(|r| r.date).max()?;
    DateRange::new(start, end)
}

fn import_event(outcome: &'static str, n: usize) {
    metrics::counter!(crate::observability::IMPORT_ROWS_TOTAL, "outcome" => outcome).increment(n as u64);
}

/// Validate `rows` and, unless dry-running or rejected, write them in one
/// transaction. The write guard is held from the referential check to the commit.
pub async fn apply_rows(
    engine: &Engine,
    rows: Vec<ImportRow>,
    scope: Option<&SnapshotScope>,
    options: &ImportOptions,
) -> Result<ImportReport, EngineError> {
    let mut state = engine.write().await;

    let missing = missing_references(&state, &rows);
    if !missing.is_empty() {
        return Err(EngineError::Referential(missing));
    }

    let row_groups: BTreeSet<GroupId> = rows.iter().map(|r| r.group_id).collect();
    let replaced: BTreeSet<GroupId> = if options.replace_existing {
        match (&options.group_ids, scope) {
            (Some(ids), _) => ids.iter().copied().collect(),
            (None, Some(s)) if !s.group_ids.is_empty() => s.group_ids.iter().copied().collect(),
            _ => row_groups.clone(),
        }
    } else {
        BTreeSet::new()
    };
    let window = replace_window(scope, &rows);
    let is_replaced = |a: &Assignment| {
        replaced.contains(&a.group_id) && window.is_some_and(|w| w.contains(a.date))
    };

    let mut capacity = CapacityTracker::seeded(state.assignments.values(), window, is_replaced);
    let mut guard = DuplicateGuard::seeded(state.assignments.values(), is_replaced);
    let scope_range = scope.and_then(SnapshotScope::range);

    let mut accepted = Vec::new();
    let mut conflicts = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let group = state.groups.get(&row.group_id);
        let proposal = ProposedAssignment {
            group_id: row.group_id,
            location_id: row.location_id,
            date: row.date,
            slot: row.slot,
            participant_count: row
                .participant_count
                .or_else(|| group.map(Group::participant_count))
                .unwrap_or(0),
        };
        let ctx = ValidationContext { scope: scope_range, slots: &engine.slots, capacity: &capacity };
        let mut found = validate(&proposal, group, state.locations.get(&row.location_id), &ctx);
        if let Some(dup) = guard.check(&proposal) {
            found.push(dup);
        }

        if found.is_empty() {
            capacity.commit(proposal.date, proposal.slot, proposal.location_id, proposal.participant_count);
            guard.record(proposal.group_id, proposal.date, proposal.slot);
            accepted.push((proposal, row.tag.clone()));
        } else {
            for c in found.iter() {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => c.kind.as_str())
                    .increment(1);
            }
            conflicts.push(RowConflict {
                index,
                group_id: row.group_id,
                location_id: row.location_id,
                date: row.date,
                slot: row.slot,
                reasons: found.into_vec(),
            });
        }
    }

    let mut report = ImportReport {
        summary: ImportSummary {
            groups: row_groups.len(),
            assignments: rows.len(),
            inserted: accepted.len(),
            skipped: conflicts.len(),
            conflicts: conflicts.len(),
        },
        conflicts,
        dry_run: options.dry_run,
        removed: 0,
        revisions: BTreeMap::new(),
    };

    if options.dry_run {
        debug!("import dry run: {:?}", report.summary);
        return Ok(report);
    }
    if !report.conflicts.is_empty() && !options.skip_conflicts {
        import_event("rejected", rows.len());
        info!("import rejected: {} conflicting rows", report.conflicts.len());
        return Err(EngineError::ImportConflicts(report.conflicts));
    }

    let removed_ids: Vec<Ulid> = {
        let mut ids: Vec<Ulid> = state
            .assignments
            .values()
            .filter(|a| is_replaced(a))
            .map(|a| a.id)
            .collect();
        ids.sort_unstable();
        ids
    };
    let mut txn = Vec::new();
    for id in &removed_ids {
        txn.push(Event::AssignmentRemoved { id: *id });
        if state.schedules.contains_key(id) {
            txn.push(Event::ScheduleRemoved { id: *id });
        }
    }

    let mut touched: BTreeSet<GroupId> = state
        .assignments
        .values()
        .filter(|a| is_replaced(a))
        .map(|a| a.group_id)
        .collect();
    for (proposal, tag) in &accepted {
        let (assignment, schedule) = mirrored(
            Ulid::new(),
            proposal,
            state.locations.get(&proposal.location_id),
            &engine.slots,
            tag.clone(),
            None,
        );
        touched.insert(assignment.group_id);
        txn.push(Event::AssignmentAdded(assignment));
        txn.push(Event::ScheduleAdded(schedule));
    }
    txn.extend(state.bump_events(touched.iter().copied()));
    engine.commit(&mut state, txn).await?;

    report.removed = removed_ids.len();
    report.revisions = touched.iter().map(|g| (*g, state.revision(*g))).collect();
    import_event("inserted", report.summary.inserted);
    import_event("skipped", report.summary.skipped);
    info!(
        "import applied: {} inserted, {} skipped, {} replaced across {} groups",
        report.summary.inserted,
        report.summary.skipped,
        report.removed,
        touched.len()
    );
    Ok(report)
}

/// Import a snapshot-shaped payload.
pub async fn import(engine: &Engine, payload: &ImportPayload, options: &ImportOptions) -> Result<ImportReport, EngineError> {
    let rows = normalize_payload(payload, options)?;
    apply_rows(engine, rows, payload.scope.as_ref(), options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_accepts_both_key_styles() {
        let camel = normalize_row(&json!({
            "groupId": 1, "locationId": 2, "date": "2025-07-01", "timeSlot": "MORNING"
        }))
        .unwrap();
        let snake = normalize_row(&json!({
            "group_id": "1", "location_id": 2, "activity_date": "2025-07-01", "time_slot": "morning"
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.participant_count, None);
    }

    #[test]
    fn normalize_reports_every_problem() {
        let errs = normalize_row(&json!({
            "groupId": 0, "date": "07/01/2025", "timeSlot": "NIGHT"
        }))
        .unwrap_err();
        assert_eq!(errs.len(), 4, "{errs:?}");
        assert!(errs.iter().any(|e| e.contains("groupId")));
        assert!(errs.iter().any(|e| e.contains("locationId is missing")));
        assert!(errs.iter().any(|e| e.contains("YYYY-MM-DD")));
        assert!(errs.iter().any(|e| e.contains("NIGHT")));
    }

    #[test]
    fn payload_schema_is_checked() {
        let payload = ImportPayload {
            schema: "other/thing@9".into(),
            scope: None,
            data: ImportData::default(),
        };
        assert!(matches!(
            normalize_payload(&payload, &ImportOptions::default()),
            Err(EngineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn structural_errors_carry_row_indices() {
        let payload = ImportPayload {
            schema: SNAPSHOT_SCHEMA.into(),
            scope: None,
            data: ImportData {
                assignments: vec![
                    json!({"groupId": 1, "locationId": 2, "date": "2025-07-01", "timeSlot": "MORNING"}),
                    json!({"groupId": 1, "locationId": 2, "date": "2025-07-01"}),
                    json!("nope"),
                ],
            },
        };
        match normalize_payload(&payload, &ImportOptions::default()) {
            Err(EngineError::Structural(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("row 1:"));
                assert!(errors[1].starts_with("row 2:"));
            }
            other => panic!("expected Structural, got {other:?}"),
        }
    }

    #[test]
    fn rows_outside_selected_groups_are_rejected() {
        let payload = ImportPayload {
            schema: SNAPSHOT_SCHEMA.into(),
            scope: None,
            data: ImportData {
                assignments: vec![
                    json!({"groupId": 3, "locationId": 2, "date": "2025-07-01", "timeSlot": "MORNING"}),
                ],
            },
        };
        let options = ImportOptions { group_ids: Some(vec![1]), ..Default::default() };
        assert!(matches!(
            normalize_payload(&payload, &options),
            Err(EngineError::Structural(_))
        ));
    }
}
