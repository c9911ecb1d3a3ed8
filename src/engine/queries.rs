use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, PlanState};

/// Filters for listing assignments. Both fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentFilter {
    pub group_id: Option<GroupId>,
    pub start_date: Option<chrono::NaiveDate>,
    pub end_date: Option<chrono::NaiveDate>,
}

impl AssignmentFilter {
    fn admits(&self, a: &Assignment) -> bool {
        if let Some(g) = self.group_id
            && a.group_id != g
        {
            return false;
        }
        if let Some(start) = self.start_date
            && a.date < start
        {
            return false;
        }
        if let Some(end) = self.end_date
            && a.date > end
        {
            return false;
        }
        true
    }
}

impl PlanState {
    /// Assignments matching `filter`, ordered by date, slot, group, location.
    pub fn list_assignments(&self, filter: &AssignmentFilter) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = self
            .assignments
            .values()
            .filter(|a| filter.admits(a))
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.date, a.slot, a.group_id, a.location_id, a.id));
        out
    }

    /// A group's schedules ordered by date then start time.
    pub fn group_schedules(&self, group_id: GroupId) -> Vec<Schedule> {
        let mut out: Vec<Schedule> = self
            .schedules
            .values()
            .filter(|s| s.group_id == group_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.date, s.start, s.end, s.id));
        out
    }
}

impl Engine {
    pub async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, EngineError> {
        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date)
            && start > end
        {
            return Err(EngineError::structural("startDate is after endDate"));
        }
        Ok(self.read().await.list_assignments(filter))
    }

    /// Schedules of one group together with its current revision.
    pub async fn group_schedules(&self, id: GroupId) -> Result<(Vec<Schedule>, u64), EngineError> {
        let state = self.read().await;
        if !state.groups.contains_key(&id) {
            return Err(EngineError::not_found("group", id));
        }
        Ok((state.group_schedules(id), state.revision(id)))
    }

    pub async fn revision_of(&self, id: GroupId) -> u64 {
        self.read().await.revision(id)
    }

    pub async fn run(&self, id: Ulid) -> Option<RunRecord> {
        self.read().await.runs.get(&id).cloned()
    }

    pub async fn lock_record(&self) -> Option<LockRecord> {
        self.read().await.lock.clone()
    }
}
