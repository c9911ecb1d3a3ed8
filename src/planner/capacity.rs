use std::collections::HashMap;

use chrono::NaiveDate;

use crate::model::*;

type Key = (NaiveDate, Slot, LocationId);

/// Participants already committed per `(date, slot, location)`.
///
/// The tracker only reports; it never rejects. `commit` is called once an
/// assignment has passed validation.
#[derive(Debug, Clone, Default)]
pub struct CapacityTracker {
    used: HashMap<Key, u32>,
}

impl CapacityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted assignments inside `window`, skipping those `exclude`
    /// selects (e.g. the groups being re-planned).
    pub fn seeded<'a>(
        assignments: impl IntoIterator<Item = &'a Assignment>,
        window: Option<DateRange>,
        exclude: impl Fn(&Assignment) -> bool,
    ) -> Self {
        let mut tracker = Self::new();
        for a in assignments {
            if window.is_some_and(|w| !w.contains(a.date)) || exclude(a) {
                continue;
            }
            tracker.commit(a.date, a.slot, a.location_id, a.participant_count);
        }
        tracker
    }

    pub fn used(&self, date: NaiveDate, slot: Slot, location_id: LocationId) -> u32 {
        self.used.get(&(date, slot, location_id)).copied().unwrap_or(0)
    }

    /// `capacity - used`, floored at zero.
    pub fn remaining(&self, location: &Location, date: NaiveDate, slot: Slot) -> u32 {
        location
            .capacity
            .saturating_sub(self.used(date, slot, location.id))
    }

    pub fn commit(&mut self, date: NaiveDate, slot: Slot, location_id: LocationId, participants: u32) {
        let used = self.used.entry((date, slot, location_id)).or_insert(0);
        *used = used.saturating_add(participants);
    }

    /// Keys whose usage exceeds the location's capacity.
    pub fn overbooked<'a>(
        &self,
        locations: &'a HashMap<LocationId, Location>,
    ) -> Vec<(NaiveDate, Slot, &'a Location, u32)> {
        let mut out: Vec<_> = self
            .used
            .iter()
            .filter_map(|(&(date, slot, lid), &used)| {
                let loc = locations.get(&lid)?;
                (used > loc.capacity).then_some((date, slot, loc, used))
            })
            .collect();
        out.sort_by_key(|(date, slot, loc, _)| (*date, *slot, loc.id));
        out
    }
}
