use chrono::{Datelike, NaiveDate, Weekday};

use crate::model::*;

/// Why a location cannot host anyone on a given date and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    Inactive,
    BlockedWeekday(Weekday),
    ClosedDate,
    /// Open hours are configured for the day but no window covers the slot.
    OutsideOpenHours,
}

/// Every reason `location` is closed for `(date, slot)`, in evaluation order.
/// Empty means available.
pub fn unavailability(
    location: &Location,
    date: NaiveDate,
    slot: Slot,
    slots: &SlotDefinitions,
) -> Vec<Unavailable> {
    let mut reasons = Vec::new();
    if !location.active {
        reasons.push(Unavailable::Inactive);
    }
    if location.weekday_blocked(date) {
        reasons.push(Unavailable::BlockedWeekday(date.weekday()));
    }
    if location.closed_dates.contains(&date) {
        reasons.push(Unavailable::ClosedDate);
    }
    if !within_open_hours(location, date, slot, slots) {
        reasons.push(Unavailable::OutsideOpenHours);
    }
    reasons
}

pub fn is_available(
    location: &Location,
    date: NaiveDate,
    slot: Slot,
    slots: &SlotDefinitions,
) -> bool {
    location.active
        && !location.weekday_blocked(date)
        && !location.closed_dates.contains(&date)
        && within_open_hours(location, date, slot, slots)
}

/// A location without any open-hours configuration for the day is always
/// time-available; otherwise the slot must fit entirely inside one window.
pub fn within_open_hours(
    location: &Location,
    date: NaiveDate,
    slot: Slot,
    slots: &SlotDefinitions,
) -> bool {
    let Some(windows) = location.open_hours.windows_for(date.weekday()) else {
        return true;
    };
    let needed = slots.window(slot);
    windows.iter().any(|w| w.contains_window(&needed))
}

pub fn matches_type(location: &Location, group: &Group) -> bool {
    location.target_groups.admits(group.group_type)
}

pub fn in_range(group: &Group, date: NaiveDate) -> bool {
    group.range().contains(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn museum() -> Location {
        Location {
            id: 1,
            name: "Museum".into(),
            capacity: 40,
            blocked_weekdays: WeekdaySet::empty(),
            closed_dates: BTreeSet::new(),
            open_hours: OpenHours::default(),
            target_groups: TargetGroups::All,
            active: true,
        }
    }

    fn group(group_type: GroupType) -> Group {
        Group {
            id: 1,
            name: "G".into(),
            group_type,
            start_date: d("2025-07-01"),
            end_date: d("2025-07-03"),
            student_count: 30,
            teacher_count: 2,
            itinerary_plan_id: None,
            must_visit: vec![],
            status: GroupStatus::Preparing,
        }
    }

    // 2025-07-07 is a Monday.
    const MONDAY: &str = "2025-07-07";

    #[test]
    fn unconfigured_location_is_always_available() {
        let slots = SlotDefinitions::default();
        for slot in Slot::ALL {
            assert!(is_available(&museum(), d(MONDAY), slot, &slots));
        }
    }

    #[test]
    fn inactive_location_is_unavailable() {
        let mut loc = museum();
        loc.active = false;
        let slots = SlotDefinitions::default();
        assert!(!is_available(&loc, d(MONDAY), Slot::Morning, &slots));
        assert_eq!(
            unavailability(&loc, d(MONDAY), Slot::Morning, &slots),
            vec![Unavailable::Inactive]
        );
    }

    #[test]
    fn blocked_weekday_and_closed_date() {
        let mut loc = museum();
        loc.blocked_weekdays = WeekdaySet::parse("1").unwrap();
        loc.closed_dates.insert(d("2025-07-08"));
        let slots = SlotDefinitions::default();

        assert_eq!(
            unavailability(&loc, d(MONDAY), Slot::Morning, &slots),
            vec![Unavailable::BlockedWeekday(Weekday::Mon)]
        );
        assert_eq!(
            unavailability(&loc, d("2025-07-08"), Slot::Morning, &slots),
            vec![Unavailable::ClosedDate]
        );
        assert!(is_available(&loc, d("2025-07-09"), Slot::Morning, &slots));
    }

    #[test]
    fn slot_must_fit_inside_one_window() {
        let mut loc = museum();
        // 09:00-17:00 covers the afternoon but not the 08:00 morning start.
        loc.open_hours.default = vec![TimeWindow::hm(9, 0, 17, 0)];
        let slots = SlotDefinitions::default();
        assert!(!is_available(&loc, d(MONDAY), Slot::Morning, &slots));
        assert!(is_available(&loc, d(MONDAY), Slot::Afternoon, &slots));
        assert!(!is_available(&loc, d(MONDAY), Slot::Evening, &slots));
    }

    #[test]
    fn weekday_windows_override_default() {
        let mut loc = museum();
        loc.open_hours = OpenHours {
            default: vec![TimeWindow::hm(8, 0, 21, 0)],
            by_weekday: HashMap::from([(Weekday::Mon, vec![TimeWindow::hm(13, 0, 17, 0)])]),
        };
        let slots = SlotDefinitions::default();
        assert!(!is_available(&loc, d(MONDAY), Slot::Morning, &slots));
        assert!(is_available(&loc, d(MONDAY), Slot::Afternoon, &slots));
        assert!(is_available(&loc, d("2025-07-08"), Slot::Morning, &slots));
    }

    #[test]
    fn split_windows_do_not_combine() {
        let mut loc = museum();
        loc.open_hours.default = vec![TimeWindow::hm(8, 0, 10, 0), TimeWindow::hm(10, 0, 12, 0)];
        let slots = SlotDefinitions::default();
        assert!(!within_open_hours(&loc, d(MONDAY), Slot::Morning, &slots));
    }

    #[test]
    fn type_and_range_predicates() {
        let mut loc = museum();
        assert!(matches_type(&loc, &group(GroupType::Vip)));
        loc.target_groups = TargetGroups::Primary;
        assert!(matches_type(&loc, &group(GroupType::Primary)));
        assert!(!matches_type(&loc, &group(GroupType::Secondary)));

        let g = group(GroupType::Primary);
        assert!(in_range(&g, d("2025-07-01")));
        assert!(in_range(&g, d("2025-07-03")));
        assert!(!in_range(&g, d("2025-07-05")));
    }
}
