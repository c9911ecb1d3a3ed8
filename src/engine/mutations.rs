use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::planner::{
    validate, CapacityTracker, ConflictList, DuplicateGuard, ProposedAssignment, ValidationContext,
};
use crate::provenance::Provenance;
use crate::revision::check_revision;

use super::{Engine, EngineError, PlanState};

/// Body of a single-assignment create/update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentInput {
    pub group_id: GroupId,
    pub location_id: LocationId,
    pub date: NaiveDate,
    #[serde(rename = "timeSlot")]
    pub slot: Slot,
    /// Defaults to the group's participant count.
    #[serde(default)]
    pub participant_count: Option<u32>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One calendar item of a whole-group replace.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub title: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
    #[serde(default)]
    pub participant_count: Option<u32>,
}

fn check_tag(tag: &str) -> Result<(), EngineError> {
    if tag.len() > MAX_TAG_LEN {
        return Err(EngineError::LimitExceeded("tag too long"));
    }
    Ok(())
}

/// Stable `custom:<hash>` tag for a free-form item.
fn check_participants(count: Option<u32>) -> Result<(), EngineError> {
    match count {
        Some(n) if n > MAX_PARTICIPANTS => Err(EngineError::structural(format!(
            "participant count {n} exceeds {MAX_PARTICIPANTS}"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn custom_tag(date: NaiveDate, start: NaiveTime, title: &str) -> String {
    let hash = crc32fast::hash(format!("{date}|{start}|{title}").as_bytes());
    Provenance::Custom { hash: format!("{hash:08x}") }.to_string()
}

/// Assignment plus its mirrored schedule, sharing one id.
pub(crate) fn mirrored(
    id: Ulid,
    p: &ProposedAssignment,
    location: Option<&Location>,
    slots: &SlotDefinitions,
    tag: Option<String>,
    title: Option<String>,
) -> (Assignment, Schedule) {
    let tag = tag.unwrap_or_else(|| {
        Provenance::PlanSync { location_id: p.location_id }.to_string()
    });
    let window = slots.window(p.slot);
    let title = title
        .or_else(|| location.map(|l| l.name.clone()))
        .unwrap_or_else(|| format!("location {}", p.location_id));
    let assignment = Assignment {
        id,
        group_id: p.group_id,
        location_id: p.location_id,
        date: p.date,
        slot: p.slot,
        participant_count: p.participant_count,
        tag: tag.clone(),
    };
    let schedule = Schedule {
        id,
        group_id: p.group_id,
        date: p.date,
        start: window.start,
        end: window.end,
        title,
        tag,
        location_id: Some(p.location_id),
    };
    (assignment, schedule)
}

fn removal_events(state: &PlanState, id: Ulid) -> Vec<Event> {
    let mut events = Vec::new();
    if state.assignments.contains_key(&id) {
        events.push(Event::AssignmentRemoved { id });
    }
    if state.schedules.contains_key(&id) {
        events.push(Event::ScheduleRemoved { id });
    }
    events
}

fn record_conflicts(list: &ConflictList) {
    for c in list.iter() {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => c.kind.as_str())
            .increment(1);
    }
}

impl Engine {
    pub async fn upsert_group(&self, group: Group) -> Result<(), EngineError> {
        if group.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("group name too long"));
        }
        if group.start_date > group.end_date {
            return Err(EngineError::structural("group start date is after its end date"));
        }
        check_participants(Some(group.participant_count()))?;
        let mut state = self.write().await;
        let txn = vec![Event::GroupUpserted(group)];
        self.commit(&mut state, txn).await
    }

    pub async fn upsert_location(&self, location: Location) -> Result<(), EngineError> {
        if location.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("location name too long"));
        }
        if location.capacity == 0 {
            return Err(EngineError::structural("location capacity must be positive"));
        }
        if location.capacity > MAX_PARTICIPANTS {
            return Err(EngineError::structural(format!(
                "location capacity exceeds {MAX_PARTICIPANTS}"
            )));
        }
        let mut state = self.write().await;
        let txn = vec![Event::LocationUpserted(location)];
        self.commit(&mut state, txn).await
    }

    /// Change a group's lifecycle status. Cancelling removes every assignment
    /// and schedule of the group in the same transaction. Returns the number
    /// of assignments removed.
    pub async fn set_group_status(&self, id: GroupId, status: GroupStatus) -> Result<usize, EngineError> {
        let mut state = self.write().await;
        if !state.groups.contains_key(&id) {
            return Err(EngineError::not_found("group", id));
        }

        let mut txn = vec![Event::GroupStatusChanged { id, status }];
        let mut removed = 0;
        if status == GroupStatus::Cancelled {
            let ids: Vec<Ulid> = state
                .schedules
                .values()
                .filter(|s| s.group_id == id)
                .map(|s| s.id)
                .chain(state.assignments.values().filter(|a| a.group_id == id).map(|a| a.id))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            removed = state.assignments.values().filter(|a| a.group_id == id).count();
            for sid in ids {
                txn.extend(removal_events(&state, sid));
            }
            txn.extend(state.bump_events([id]));
        }
        self.commit(&mut state, txn).await?;
        if status == GroupStatus::Cancelled {
            info!("group {id} cancelled, {removed} assignments removed");
        }
        Ok(removed)
    }

    fn check_assignment(
        &self,
        state: &PlanState,
        p: &ProposedAssignment,
        replacing: Option<Ulid>,
    ) -> ConflictList {
        let window = DateRange { start: p.date, end: p.date };
        let capacity = CapacityTracker::seeded(state.assignments.values(), Some(window), |a| {
            Some(a.id) == replacing
        });
        let guard = DuplicateGuard::seeded(state.assignments.values(), |a| Some(a.id) == replacing);
        let ctx = ValidationContext { scope: None, slots: &self.slots, capacity: &capacity };
        let mut conflicts = validate(
            p,
            state.groups.get(&p.group_id),
            state.locations.get(&p.location_id),
            &ctx,
        );
        if let Some(dup) = guard.check(p) {
            conflicts.push(dup);
        }
        conflicts
    }

    fn proposal_from(state: &PlanState, input: &AssignmentInput) -> ProposedAssignment {
        let participant_count = input.participant_count.unwrap_or_else(|| {
            state
                .groups
                .get(&input.group_id)
                .map(Group::participant_count)
                .unwrap_or(0)
        });
        ProposedAssignment {
            group_id: input.group_id,
            location_id: input.location_id,
            date: input.date,
            slot: input.slot,
            participant_count,
        }
    }

    /// Create one assignment (and its mirrored schedule). Hard conflicts always
    /// reject; soft conflicts reject unless `ignore_conflicts`.
    pub async fn create_assignment(
        &self,
        input: AssignmentInput,
        ignore_conflicts: bool,
    ) -> Result<Assignment, EngineError> {
        if let Some(tag) = &input.tag {
            check_tag(tag)?;
        }
        check_participants(input.participant_count)?;
        let mut state = self.write().await;
        let proposal = Self::proposal_from(&state, &input);
        let conflicts = self.check_assignment(&state, &proposal, None);
        if conflicts.blocks(ignore_conflicts) {
            record_conflicts(&conflicts);
            return Err(EngineError::Conflicts(conflicts));
        }

        let (assignment, schedule) = mirrored(
            Ulid::new(),
            &proposal,
            state.locations.get(&proposal.location_id),
            &self.slots,
            input.tag,
            input.title,
        );
        let mut txn = vec![
            Event::AssignmentAdded(assignment.clone()),
            Event::ScheduleAdded(schedule),
        ];
        txn.extend(state.bump_events([proposal.group_id]));
        self.commit(&mut state, txn).await?;
        debug!(
            "assignment {} created: group {} at {} on {} {}",
            assignment.id, assignment.group_id, assignment.location_id, assignment.date, assignment.slot
        );
        Ok(assignment)
    }

    pub async fn update_assignment(
        &self,
        id: Ulid,
        input: AssignmentInput,
        ignore_conflicts: bool,
    ) -> Result<Assignment, EngineError> {
        if let Some(tag) = &input.tag {
            check_tag(tag)?;
        }
        check_participants(input.participant_count)?;
        let mut state = self.write().await;
        let previous = state
            .assignments
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("assignment", id))?;

        let proposal = Self::proposal_from(&state, &input);
        let conflicts = self.check_assignment(&state, &proposal, Some(id));
        if conflicts.blocks(ignore_conflicts) {
            record_conflicts(&conflicts);
            return Err(EngineError::Conflicts(conflicts));
        }

        let tag = input.tag.or_else(|| {
            // A plan-derived tag follows the location; anything else is kept.
            let prev = Provenance::parse(&previous.tag);
            (!prev.is_plan_derived()).then(|| previous.tag.clone())
        });
        let (assignment, schedule) = mirrored(
            id,
            &proposal,
            state.locations.get(&proposal.location_id),
            &self.slots,
            tag,
            input.title,
        );
        let mut txn = removal_events(&state, id);
        txn.push(Event::AssignmentAdded(assignment.clone()));
        txn.push(Event::ScheduleAdded(schedule));
        txn.extend(state.bump_events([previous.group_id, proposal.group_id]));
        self.commit(&mut state, txn).await?;
        Ok(assignment)
    }

    pub async fn delete_assignment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut state = self.write().await;
        let group_id = state
            .assignments
            .get(&id)
            .map(|a| a.group_id)
            .ok_or_else(|| EngineError::not_found("assignment", id))?;
        let mut txn = removal_events(&state, id);
        txn.extend(state.bump_events([group_id]));
        self.commit(&mut state, txn).await
    }

    /// Replace every schedule of `group_id` in one transaction, guarded by the
    /// group's revision. Items bound to a location produce mirrored assignments
    /// that go through the same conflict validation as single edits, except
    /// that soft conflicts reject the whole batch too.
    ///
    /// Returns the stored list and the new revision.
    pub async fn replace_group_schedules(
        &self,
        group_id: GroupId,
        expected_revision: u64,
        items: Vec<ScheduleInput>,
    ) -> Result<(Vec<Schedule>, u64), EngineError> {
        if items.len() > MAX_SCHEDULES_PER_REPLACE {
            return Err(EngineError::LimitExceeded("too many schedule items"));
        }
        let mut state = self.write().await;
        let group = state
            .groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("group", group_id))?;

        check_revision(group_id, state.revision(group_id), expected_revision)?;

        let mut errors = Vec::new();
        let mut new_schedules = Vec::with_capacity(items.len());
        let mut new_assignments = Vec::new();
        let mut proposals = Vec::new();

        for (idx, item) in items.into_iter().enumerate() {
            if item.end <= item.start {
                errors.push(format!("item {idx}: end time must be after start time"));
                continue;
            }
            if item.title.len() > MAX_NAME_LEN {
                errors.push(format!("item {idx}: title too long"));
                continue;
            }
            if let Some(tag) = &item.tag
                && tag.len() > MAX_TAG_LEN
            {
                errors.push(format!("item {idx}: tag too long"));
                continue;
            }
            if item.participant_count.is_some_and(|n| n > MAX_PARTICIPANTS) {
                errors.push(format!("item {idx}: participant count exceeds {MAX_PARTICIPANTS}"));
                continue;
            }
            let bound = item
                .location_id
                .or_else(|| item.tag.as_deref().and_then(|t| Provenance::parse(t).location_id()));
            let tag = item.tag.clone().unwrap_or_else(|| match bound {
                Some(location_id) => Provenance::PlanSync { location_id }.to_string(),
                None => custom_tag(item.date, item.start, &item.title),
            });
            let id = Ulid::new();

            if let Some(location_id) = bound {
                let Some(slot) = self.slots.slot_for_time(item.start) else {
                    errors.push(format!("item {idx}: start time {} is outside every slot", item.start));
                    continue;
                };
                let proposal = ProposedAssignment {
                    group_id,
                    location_id,
                    date: item.date,
                    slot,
                    participant_count: item.participant_count.unwrap_or(group.participant_count()),
                };
                proposals.push(proposal);
                new_assignments.push(Assignment {
                    id,
                    group_id,
                    location_id,
                    date: item.date,
                    slot,
                    participant_count: proposal.participant_count,
                    tag: tag.clone(),
                });
            }
            new_schedules.push(Schedule {
                id,
                group_id,
                date: item.date,
                start: item.start,
                end: item.end,
                title: item.title,
                tag,
                location_id: bound,
            });
        }
        if !errors.is_empty() {
            return Err(EngineError::Structural(errors));
        }

        let mut capacity =
            CapacityTracker::seeded(state.assignments.values(), None, |a| a.group_id == group_id);
        let mut guard = DuplicateGuard::seeded(state.assignments.values(), |a| a.group_id == group_id);
        let mut conflicts = ConflictList::new();
        for p in &proposals {
            let ctx = ValidationContext { scope: None, slots: &self.slots, capacity: &capacity };
            let mut found = validate(
                p,
                Some(&group),
                state.locations.get(&p.location_id),
                &ctx,
            );
            if let Some(dup) = guard.check(p) {
                found.push(dup);
            }
            if found.is_empty() {
                capacity.commit(p.date, p.slot, p.location_id, p.participant_count);
                guard.record(p.group_id, p.date, p.slot);
            }
            conflicts.extend(found);
        }
        if conflicts.blocks(false) {
            record_conflicts(&conflicts);
            return Err(EngineError::Conflicts(conflicts));
        }

        let old_ids: std::collections::BTreeSet<Ulid> = state
            .schedules
            .values()
            .filter(|s| s.group_id == group_id)
            .map(|s| s.id)
            .chain(state.assignments.values().filter(|a| a.group_id == group_id).map(|a| a.id))
            .collect();
        let mut txn = Vec::new();
        for id in old_ids {
            txn.extend(removal_events(&state, id));
        }
        txn.extend(new_assignments.into_iter().map(Event::AssignmentAdded));
        txn.extend(new_schedules.into_iter().map(Event::ScheduleAdded));
        txn.extend(state.bump_events([group_id]));
        self.commit(&mut state, txn).await?;

        let revision = state.revision(group_id);
        info!("group {group_id} schedules replaced, revision {revision}");
        Ok((state.group_schedules(group_id), revision))
    }

    /// Persist a solver run record (insert or overwrite).
    pub async fn record_run(&self, run: RunRecord) -> Result<(), EngineError> {
        let mut state = self.write().await;
        self.commit(&mut state, vec![Event::RunRecorded(run)]).await
    }

    /// Mark runs that never finished as lost. Called once at startup, before
    /// the solver worker accepts new runs.
    pub async fn mark_lost_runs(&self) -> Result<Vec<Ulid>, EngineError> {
        let mut state = self.write().await;
        let now = now_ms();
        let lost: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| RunRecord {
                status: RunStatus::Lost,
                finished_at: Some(now),
                error: Some("process restarted before the run finished".into()),
                ..r.clone()
            })
            .collect();
        let ids = lost.iter().map(|r| r.id).collect();
        self.commit(&mut state, lost.into_iter().map(Event::RunRecorded).collect())
            .await?;
        Ok(ids)
    }
}
