use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::*;

use super::capacity::CapacityTracker;
use super::constraint::{self, Unavailable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    OutOfScope,
    InvalidParticipants,
    UnknownGroup,
    UnknownLocation,
    GroupCancelled,
    GroupDateRange,
    LocationInactive,
    LocationBlockedWeekday,
    LocationClosedDate,
    LocationClosedHours,
    GroupTypeMismatch,
    DuplicateGroupSlot,
    Capacity,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::OutOfScope => "out_of_scope",
            ConflictKind::InvalidParticipants => "invalid_participants",
            ConflictKind::UnknownGroup => "unknown_group",
            ConflictKind::UnknownLocation => "unknown_location",
            ConflictKind::GroupCancelled => "group_cancelled",
            ConflictKind::GroupDateRange => "group_date_range",
            ConflictKind::LocationInactive => "location_inactive",
            ConflictKind::LocationBlockedWeekday => "location_blocked_weekday",
            ConflictKind::LocationClosedDate => "location_closed_date",
            ConflictKind::LocationClosedHours => "location_closed_hours",
            ConflictKind::GroupTypeMismatch => "group_type_mismatch",
            ConflictKind::DuplicateGroupSlot => "duplicate_group_slot",
            ConflictKind::Capacity => "capacity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Vetoes the edit outright.
    Hard,
    /// Advisory; single edits may bypass with `ignoreConflicts`.
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<u32>,
}

impl Conflict {
    pub fn hard(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Hard,
            message: message.into(),
            current: None,
            capacity: None,
            requested: None,
        }
    }

    pub fn capacity(location: &Location, date: NaiveDate, slot: Slot, used: u32, requested: u32) -> Self {
        Self {
            kind: ConflictKind::Capacity,
            severity: Severity::Soft,
            message: format!(
                "{} on {date} {slot} is over capacity: current {used} vs capacity {}, requested {requested}",
                location.name, location.capacity
            ),
            current: Some(used),
            capacity: Some(location.capacity),
            requested: Some(requested),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConflictList(Vec<Conflict>);

impl ConflictList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.0.push(conflict);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn has_hard(&self) -> bool {
        self.0.iter().any(|c| c.severity == Severity::Hard)
    }

    /// Whether the list blocks a write, given the caller's bypass flag.
    pub fn blocks(&self, ignore_soft: bool) -> bool {
        if ignore_soft { self.has_hard() } else { !self.is_empty() }
    }

    pub fn kinds(&self) -> Vec<ConflictKind> {
        self.0.iter().map(|c| c.kind).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: ConflictList) {
        self.0.extend(other.0);
    }

    pub fn into_vec(self) -> Vec<Conflict> {
        self.0
    }
}

/// An assignment before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAssignment {
    pub group_id: GroupId,
    pub location_id: LocationId,
    pub date: NaiveDate,
    #[serde(rename = "timeSlot")]
    pub slot: Slot,
    pub participant_count: u32,
}

pub struct ValidationContext<'a> {
    /// Dates outside this range are structural failures.
    pub scope: Option<DateRange>,
    pub slots: &'a SlotDefinitions,
    pub capacity: &'a CapacityTracker,
}

/// Classify `proposal` against the calendar, eligibility and capacity rules.
///
/// `group` / `location` are `None` when the referenced id does not exist.
pub fn validate(
    proposal: &ProposedAssignment,
    group: Option<&Group>,
    location: Option<&Location>,
    ctx: &ValidationContext<'_>,
) -> ConflictList {
    let mut out = ConflictList::new();
    let ProposedAssignment { group_id, location_id, date, slot, participant_count } = *proposal;

    // 1. Structural
    if let Some(scope) = ctx.scope
        && !scope.contains(date)
    {
        out.push(Conflict::hard(
            ConflictKind::OutOfScope,
            format!("{date} is outside the planning window {} – {}", scope.start, scope.end),
        ));
    }
    if participant_count == 0 {
        out.push(Conflict::hard(
            ConflictKind::InvalidParticipants,
            "participant count must be positive",
        ));
    }
    if group.is_none() {
        out.push(Conflict::hard(ConflictKind::UnknownGroup, format!("group {group_id} does not exist")));
    }
    if location.is_none() {
        out.push(Conflict::hard(
            ConflictKind::UnknownLocation,
            format!("location {location_id} does not exist"),
        ));
    }

    // 2. Hard
    if let Some(g) = group {
        if g.is_cancelled() {
            out.push(Conflict::hard(
                ConflictKind::GroupCancelled,
                format!("group {} is cancelled", g.name),
            ));
        }
        if !constraint::in_range(g, date) {
            out.push(Conflict::hard(
                ConflictKind::GroupDateRange,
                format!(
                    "{date} is outside the trip dates of {} ({} – {})",
                    g.name, g.start_date, g.end_date
                ),
            ));
        }
    }
    if let Some(loc) = location {
        for reason in constraint::unavailability(loc, date, slot, ctx.slots) {
            out.push(match reason {
                Unavailable::Inactive => Conflict::hard(
                    ConflictKind::LocationInactive,
                    format!("{} is inactive", loc.name),
                ),
                Unavailable::BlockedWeekday(day) => Conflict::hard(
                    ConflictKind::LocationBlockedWeekday,
                    format!("{} is closed on {day}", loc.name),
                ),
                Unavailable::ClosedDate => Conflict::hard(
                    ConflictKind::LocationClosedDate,
                    format!("{} is closed on {date}", loc.name),
                ),
                Unavailable::OutsideOpenHours => Conflict::hard(
                    ConflictKind::LocationClosedHours,
                    format!("{} is not open for the whole {slot} slot on {date}", loc.name),
                ),
            });
        }
        if let Some(g) = group
            && !constraint::matches_type(loc, g)
        {
            out.push(Conflict::hard(
                ConflictKind::GroupTypeMismatch,
                format!(
                    "{} does not admit {} groups ({})",
                    loc.name,
                    g.group_type.as_str(),
                    g.name
                ),
            ));
        }

        // 3. Soft / capacity
        let used = ctx.capacity.used(date, slot, loc.id);
        if used.saturating_add(participant_count) > loc.capacity {
            out.push(Conflict::capacity(loc, date, slot, used, participant_count));
        }
    }

    out
}

/// Rejects a second booking of one group in the same `(date, slot)`.
#[derive(Debug, Clone, Default)]
pub struct DuplicateGuard {
    booked: HashSet<(GroupId, NaiveDate, Slot)>,
}

impl DuplicateGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded<'a>(
        assignments: impl IntoIterator<Item = &'a Assignment>,
        exclude: impl Fn(&Assignment) -> bool,
    ) -> Self {
        let mut guard = Self::new();
        for a in assignments {
            if !exclude(a) {
                guard.record(a.group_id, a.date, a.slot);
            }
        }
        guard
    }

    pub fn is_booked(&self, group_id: GroupId, date: NaiveDate, slot: Slot) -> bool {
        self.booked.contains(&(group_id, date, slot))
    }

    pub fn check(&self, p: &ProposedAssignment) -> Option<Conflict> {
        self.is_booked(p.group_id, p.date, p.slot).then(|| {
            Conflict::hard(
                ConflictKind::DuplicateGroupSlot,
                format!("group {} is already booked on {} {}", p.group_id, p.date, p.slot),
            )
        })
    }

    pub fn record(&mut self, group_id: GroupId, date: NaiveDate, slot: Slot) {
        self.booked.insert((group_id, date, slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn group(id: GroupId, size: u32) -> Group {
        Group {
            id,
            name: format!("Group {id}"),
            group_type: GroupType::Primary,
            start_date: d("2025-07-01"),
            end_date: d("2025-07-03"),
            student_count: size,
            teacher_count: 0,
            itinerary_plan_id: None,
            must_visit: vec![],
            status: GroupStatus::Preparing,
        }
    }

    fn location(capacity: u32) -> Location {
        Location {
            id: 5,
            name: "Aquarium".into(),
            capacity,
            blocked_weekdays: WeekdaySet::empty(),
            closed_dates: BTreeSet::new(),
            open_hours: OpenHours::default(),
            target_groups: TargetGroups::All,
            active: true,
        }
    }

    fn proposal(date: &str, n: u32) -> ProposedAssignment {
        ProposedAssignment {
            group_id: 1,
            location_id: 5,
            date: d(date),
            slot: Slot::Morning,
            participant_count: n,
        }
    }

    fn run(p: &ProposedAssignment, g: &Group, l: &Location, t: &CapacityTracker) -> ConflictList {
        let slots = SlotDefinitions::default();
        let ctx = ValidationContext { scope: None, slots: &slots, capacity: t };
        validate(p, Some(g), Some(l), &ctx)
    }

    #[test]
    fn clean_assignment_has_no_conflicts() {
        let out = run(&proposal("2025-07-02", 30), &group(1, 30), &location(40), &CapacityTracker::new());
        assert!(out.is_empty());
    }

    #[test]
    fn oversized_group_reports_capacity_numbers() {
        let out = run(&proposal("2025-07-02", 44), &group(1, 44), &location(40), &CapacityTracker::new());
        assert_eq!(out.kinds(), vec![ConflictKind::Capacity]);
        let c = out.iter().next().unwrap();
        assert_eq!(c.severity, Severity::Soft);
        assert_eq!((c.current, c.capacity, c.requested), (Some(0), Some(40), Some(44)));
        assert!(c.message.contains("current 0"));
        assert!(c.message.contains("capacity 40"));
        assert!(c.message.contains("requested 44"));
        assert!(!out.blocks(true));
        assert!(out.blocks(false));
    }

    #[test]
    fn existing_usage_counts_towards_capacity() {
        let mut t = CapacityTracker::new();
        t.commit(d("2025-07-02"), Slot::Morning, 5, 30);
        let out = run(&proposal("2025-07-02", 10), &group(1, 10), &location(40), &t);
        assert!(out.is_empty());
        let out = run(&proposal("2025-07-02", 11), &group(1, 11), &location(40), &t);
        assert_eq!(out.kinds(), vec![ConflictKind::Capacity]);
    }

    #[test]
    fn date_outside_trip_is_hard() {
        let out = run(&proposal("2025-07-05", 10), &group(1, 10), &location(40), &CapacityTracker::new());
        assert_eq!(out.kinds(), vec![ConflictKind::GroupDateRange]);
        assert!(out.has_hard());
        assert!(out.blocks(true));
    }

    #[test]
    fn failures_accumulate_in_fixed_order() {
        let mut loc = location(10);
        loc.active = false;
        loc.target_groups = TargetGroups::Vip;
        loc.closed_dates.insert(d("2025-07-05"));
        let slots = SlotDefinitions::default();
        let t = CapacityTracker::new();
        let ctx = ValidationContext {
            scope: DateRange::new(d("2025-07-01"), d("2025-07-04")),
            slots: &slots,
            capacity: &t,
        };
        let out = validate(&proposal("2025-07-05", 20), Some(&group(1, 20)), Some(&loc), &ctx);
        assert_eq!(
            out.kinds(),
            vec![
                ConflictKind::OutOfScope,
                ConflictKind::GroupDateRange,
                ConflictKind::LocationInactive,
                ConflictKind::LocationClosedDate,
                ConflictKind::GroupTypeMismatch,
                ConflictKind::Capacity,
            ]
        );
    }

    #[test]
    fn unknown_references_are_reported() {
        let slots = SlotDefinitions::default();
        let t = CapacityTracker::new();
        let ctx = ValidationContext { scope: None, slots: &slots, capacity: &t };
        let out = validate(&proposal("2025-07-02", 0), None, None, &ctx);
        assert_eq!(
            out.kinds(),
            vec![
                ConflictKind::InvalidParticipants,
                ConflictKind::UnknownGroup,
                ConflictKind::UnknownLocation
            ]
        );
    }

    #[test]
    fn cancelled_group_is_hard() {
        let mut g = group(1, 10);
        g.status = GroupStatus::Cancelled;
        let out = run(&proposal("2025-07-02", 10), &g, &location(40), &CapacityTracker::new());
        assert_eq!(out.kinds(), vec![ConflictKind::GroupCancelled]);
    }

    #[test]
    fn duplicate_guard_flags_second_booking() {
        let mut guard = DuplicateGuard::new();
        let p = proposal("2025-07-02", 10);
        assert!(guard.check(&p).is_none());
        guard.record(p.group_id, p.date, p.slot);
        assert_eq!(guard.check(&p).unwrap().kind, ConflictKind::DuplicateGroupSlot);
        let afternoon = ProposedAssignment { slot: Slot::Afternoon, ..p };
        assert!(guard.check(&afternoon).is_none());
    }
}
