use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::*;

use super::capacity::CapacityTracker;
use super::constraint;
use super::validator::{DuplicateGuard, ProposedAssignment};

pub const UNPLACED_REASON: &str = "no available capacity/window";

/// Ranked location ids from an external hint source.
///
/// `group_id = None` applies to every group. A hint with `date` and/or `slot`
/// only steers those cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceHint {
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub location_ids: Vec<LocationId>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default, rename = "timeSlot")]
    pub slot: Option<Slot>,
}

impl PreferenceHint {
    fn applies_to(&self, group_id: GroupId) -> bool {
        self.group_id.is_none_or(|g| g == group_id)
    }

    fn is_cell_specific(&self) -> bool {
        self.date.is_some() || self.slot.is_some()
    }

    fn matches_cell(&self, date: NaiveDate, slot: Slot) -> bool {
        self.date.is_none_or(|d| d == date) && self.slot.is_none_or(|s| s == slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unplaced {
    pub group_id: GroupId,
    pub date: NaiveDate,
    #[serde(rename = "timeSlot")]
    pub slot: Slot,
    pub participant_count: u32,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Allocation {
    pub assignments: Vec<ProposedAssignment>,
    pub unplaced: Vec<Unplaced>,
}

pub struct AllocationInput<'a> {
    pub groups: Vec<&'a Group>,
    pub locations: Vec<&'a Location>,
    pub range: DateRange,
    pub slots: Vec<Slot>,
    pub slot_defs: &'a SlotDefinitions,
    pub hints: &'a [PreferenceHint],
    /// Usage already committed by persisted assignments.
    pub capacity: &'a CapacityTracker,
    /// `(group, date, slot)` cells that already hold an assignment.
    pub booked: &'a DuplicateGuard,
    /// Locations each group already visits outside this run.
    pub visited: HashMap<GroupId, HashSet<LocationId>>,
}

/// Default preference order for one group: undated hints, must-visit
/// locations, eligible locations by descending capacity, then everything else.
pub fn preference_order(
    group: &Group,
    locations: &[&Location],
    hints: &[PreferenceHint],
) -> Vec<LocationId> {
    let mut order = Vec::with_capacity(locations.len());
    let mut seen = HashSet::new();
    let mut push = |id: LocationId, order: &mut Vec<LocationId>| {
        if seen.insert(id) {
            order.push(id);
        }
    };

    for hint in hints
        .iter()
        .filter(|h| h.applies_to(group.id) && !h.is_cell_specific())
    {
        for id in &hint.location_ids {
            push(*id, &mut order);
        }
    }
    for id in &group.must_visit {
        push(*id, &mut order);
    }

    let mut eligible: Vec<&Location> = locations
        .iter()
        .copied()
        .filter(|l| constraint::matches_type(l, group))
        .collect();
    eligible.sort_by(|a, b| b.capacity.cmp(&a.capacity).then(a.id.cmp(&b.id)));
    for loc in eligible {
        push(loc.id, &mut order);
    }

    let mut rest: Vec<LocationId> = locations.iter().map(|l| l.id).collect();
    rest.sort_unstable();
    for id in rest {
        push(id, &mut order);
    }
    order
}

pub fn allocate(input: &AllocationInput<'_>) -> Allocation {
    let by_id: HashMap<LocationId, &Location> =
        input.locations.iter().map(|l| (l.id, *l)).collect();

    let mut groups: Vec<&Group> = input
        .groups
        .iter()
        .copied()
        .filter(|g| !g.is_cancelled() && g.range().intersects(&input.range))
        .collect();
    groups.sort_by(|a, b| {
        b.participant_count()
            .cmp(&a.participant_count())
            .then(a.id.cmp(&b.id))
    });

    let base_order: HashMap<GroupId, Vec<LocationId>> = groups
        .iter()
        .map(|g| (g.id, preference_order(g, &input.locations, input.hints)))
        .collect();

    let mut visited = input.visited.clone();
    let mut out = Allocation::default();

    for date in input.range.days() {
        for &slot in &input.slots {
            let mut remaining: HashMap<LocationId, u32> = input
                .locations
                .iter()
                .filter(|l| constraint::is_available(l, date, slot, input.slot_defs))
                .map(|l| (l.id, input.capacity.remaining(l, date, slot)))
                .collect();

            for group in groups.iter().filter(|g| constraint::in_range(g, date)) {
                if input.booked.is_booked(group.id, date, slot) {
                    continue;
                }
                let size = group.participant_count();
                let order = cell_order(group.id, date, slot, &base_order[&group.id], input.hints);
                let seen = visited.entry(group.id).or_default();

                let fits = |id: &LocationId, remaining: &HashMap<LocationId, u32>| {
                    by_id.get(id).is_some_and(|loc| {
                        constraint::matches_type(loc, group)
                            && remaining.get(id).is_some_and(|r| *r >= size)
                    })
                };
                let choice = order
                    .iter()
                    .find(|id| !seen.contains(*id) && fits(id, &remaining))
                    .or_else(|| order.iter().find(|id| fits(id, &remaining)))
                    .copied();

                match choice {
                    Some(location_id) => {
                        if let Some(r) = remaining.get_mut(&location_id) {
                            *r -= size;
                        }
                        seen.insert(location_id);
                        out.assignments.push(ProposedAssignment {
                            group_id: group.id,
                            location_id,
                            date,
                            slot,
                            participant_count: size,
                        });
                    }
                    None => out.unplaced.push(Unplaced {
                        group_id: group.id,
                        date,
                        slot,
                        participant_count: size,
                        reason: UNPLACED_REASON,
                    }),
                }
            }
        }
    }

    out
}

/// Cell-specific hints spliced in front of the group's base order.
fn cell_order(
    group_id: GroupId,
    date: NaiveDate,
    slot: Slot,
    base: &[LocationId],
    hints: &[PreferenceHint],
) -> Vec<LocationId> {
    let mut front: Vec<LocationId> = Vec::new();
    for hint in hints
        .iter()
        .filter(|h| h.applies_to(group_id) && h.is_cell_specific() && h.matches_cell(date, slot))
    {
        for id in &hint.location_ids {
            if !front.contains(id) {
                front.push(*id);
            }
        }
    }
    if front.is_empty() {
        return base.to_vec();
    }
    let tail: Vec<LocationId> = base.iter().filter(|id| !front.contains(id)).copied().collect();
    front.extend(tail);
    front
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn group(id: GroupId, group_type: GroupType, size: u32) -> Group {
        Group {
            id,
            name: format!("Group {id}"),
            group_type,
            start_date: d("2025-07-01"),
            end_date: d("2025-07-01"),
            student_count: size,
            teacher_count: 0,
            itinerary_plan_id: None,
            must_visit: vec![],
            status: GroupStatus::Preparing,
        }
    }

    fn location(id: LocationId, capacity: u32, target: TargetGroups) -> Location {
        Location {
            id,
            name: format!("L{id}"),
            capacity,
            blocked_weekdays: WeekdaySet::empty(),
            closed_dates: BTreeSet::new(),
            open_hours: OpenHours::default(),
            target_groups: target,
            active: true,
        }
    }

    struct Fixture {
        groups: Vec<Group>,
        locations: Vec<Location>,
        hints: Vec<PreferenceHint>,
        capacity: CapacityTracker,
        booked: DuplicateGuard,
        slot_defs: SlotDefinitions,
    }

    impl Fixture {
        fn new(groups: Vec<Group>, locations: Vec<Location>) -> Self {
            Self {
                groups,
                locations,
                hints: vec![],
                capacity: CapacityTracker::new(),
                booked: DuplicateGuard::new(),
                slot_defs: SlotDefinitions::default(),
            }
        }

        fn run(&self, slots: &[Slot]) -> Allocation {
            let input = AllocationInput {
                groups: self.groups.iter().collect(),
                locations: self.locations.iter().collect(),
                range: DateRange::new(d("2025-07-01"), d("2025-07-01")).unwrap(),
                slots: slots.to_vec(),
                slot_defs: &self.slot_defs,
                hints: &self.hints,
                capacity: &self.capacity,
                booked: &self.booked,
                visited: HashMap::new(),
            };
            allocate(&input)
        }
    }

    fn placed(a: &Allocation, group_id: GroupId) -> Option<LocationId> {
        a.assignments
            .iter()
            .find(|p| p.group_id == group_id)
            .map(|p| p.location_id)
    }

    #[test]
    fn larger_groups_pick_first() {
        let f = Fixture::new(
            vec![group(1, GroupType::Primary, 10), group(2, GroupType::Primary, 30)],
            vec![location(100, 30, TargetGroups::All), location(200, 20, TargetGroups::All)],
        );
        let a = f.run(&[Slot::Morning]);
        assert_eq!(placed(&a, 2), Some(100));
        assert_eq!(placed(&a, 1), Some(200));
        assert!(a.unplaced.is_empty());
    }

    #[test]
    fn remaining_capacity_is_shared_within_a_slot() {
        let f = Fixture::new(
            vec![group(1, GroupType::Primary, 25), group(2, GroupType::Primary, 20)],
            vec![location(100, 40, TargetGroups::All)],
        );
        let a = f.run(&[Slot::Morning]);
        assert_eq!(placed(&a, 1), Some(100));
        assert_eq!(a.unplaced.len(), 1);
        assert_eq!(a.unplaced[0].group_id, 2);
        assert_eq!(a.unplaced[0].reason, UNPLACED_REASON);
    }

    #[test]
    fn never_assigns_ineligible_type() {
        let f = Fixture::new(
            vec![group(1, GroupType::Secondary, 10)],
            vec![location(100, 100, TargetGroups::Primary)],
        );
        let a = f.run(&[Slot::Morning]);
        assert!(a.assignments.is_empty());
        assert_eq!(a.unplaced.len(), 1);
    }

    #[test]
    fn seeded_usage_reduces_remaining() {
        let mut f = Fixture::new(
            vec![group(1, GroupType::Primary, 20)],
            vec![location(100, 40, TargetGroups::All), location(200, 25, TargetGroups::All)],
        );
        f.capacity.commit(d("2025-07-01"), Slot::Morning, 100, 30);
        let a = f.run(&[Slot::Morning]);
        assert_eq!(placed(&a, 1), Some(200));
    }

    #[test]
    fn hints_go_first_and_unknown_hints_are_ignored() {
        let mut f = Fixture::new(
            vec![group(1, GroupType::Primary, 10)],
            vec![location(100, 50, TargetGroups::All), location(200, 20, TargetGroups::All)],
        );
        f.hints = vec![PreferenceHint {
            group_id: Some(1),
            location_ids: vec![999, 200],
            date: None,
            slot: None,
        }];
        let a = f.run(&[Slot::Morning]);
        assert_eq!(placed(&a, 1), Some(200));
    }

    #[test]
    fn cell_specific_hint_only_steers_its_slot() {
        let mut f = Fixture::new(
            vec![group(1, GroupType::Primary, 10)],
            vec![
                location(100, 50, TargetGroups::All),
                location(200, 20, TargetGroups::All),
                location(300, 15, TargetGroups::All),
            ],
        );
        f.hints = vec![PreferenceHint {
            group_id: None,
            location_ids: vec![300],
            date: None,
            slot: Some(Slot::Afternoon),
        }];
        let a = f.run(&[Slot::Morning, Slot::Afternoon]);
        let by_slot: HashMap<Slot, LocationId> =
            a.assignments.iter().map(|p| (p.slot, p.location_id)).collect();
        assert_eq!(by_slot[&Slot::Morning], 100);
        assert_eq!(by_slot[&Slot::Afternoon], 300);
    }

    #[test]
    fn prefers_unvisited_locations_then_falls_back() {
        let f = Fixture::new(
            vec![group(1, GroupType::Primary, 10)],
            vec![location(100, 50, TargetGroups::All), location(200, 20, TargetGroups::All)],
        );
        let a = f.run(&Slot::ALL);
        let locs: Vec<LocationId> = a.assignments.iter().map(|p| p.location_id).collect();
        assert_eq!(locs, vec![100, 200, 100]);
    }

    #[test]
    fn booked_cells_are_skipped() {
        let mut f = Fixture::new(
            vec![group(1, GroupType::Primary, 10)],
            vec![location(100, 50, TargetGroups::All)],
        );
        f.booked.record(1, d("2025-07-01"), Slot::Morning);
        let a = f.run(&[Slot::Morning, Slot::Afternoon]);
        assert_eq!(a.assignments.len(), 1);
        assert_eq!(a.assignments[0].slot, Slot::Afternoon);
    }

    #[test]
    fn preference_order_puts_same_type_by_capacity_before_rest() {
        let mut g = group(1, GroupType::Vip, 5);
        g.must_visit = vec![400];
        let locs = [
            location(100, 10, TargetGroups::Primary),
            location(200, 30, TargetGroups::All),
            location(300, 50, TargetGroups::Vip),
            location(400, 5, TargetGroups::All),
        ];
        let refs: Vec<&Location> = locs.iter().collect();
        assert_eq!(preference_order(&g, &refs, &[]), vec![400, 300, 200, 100]);
    }

    #[test]
    fn allocation_is_deterministic() {
        let groups: Vec<Group> = (1..=12)
            .map(|i| group(i, GroupType::Primary, 5 + (i as u32 % 4) * 5))
            .collect();
        let locations: Vec<Location> = (1..=4)
            .map(|i| location(i * 100, 20 + i as u32 * 5, TargetGroups::All))
            .collect();
        let f = Fixture::new(groups, locations);
        let a = f.run(&Slot::ALL);
        let b = f.run(&Slot::ALL);
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.unplaced, b.unplaced);

        // Capacity invariant over the generated set.
        let mut used: HashMap<(Slot, LocationId), u32> = HashMap::new();
        for p in &a.assignments {
            *used.entry((p.slot, p.location_id)).or_default() += p.participant_count;
        }
        for ((_, lid), total) in used {
            let cap = f.locations.iter().find(|l| l.id == lid).unwrap().capacity;
            assert!(total <= cap);
        }
    }
}
