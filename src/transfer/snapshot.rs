use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

/// Schema tag written on export and required on import.
pub const SNAPSHOT_SCHEMA: &str = "tourslot/snapshot@1";

/// Self-contained, versioned export of a planning window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema: String,
    pub metadata: SnapshotMetadata,
    pub scope: SnapshotScope,
    pub rules: SnapshotRules,
    pub data: SnapshotData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub id: Ulid,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotScope {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub group_ids: Vec<GroupId>,
}

impl SnapshotScope {
    pub fn range(&self) -> Option<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRules {
    pub slots: Vec<SlotDefinition>,
    /// Every must-visit location of a group has to be placed.
    #[serde(default)]
    pub all_items_mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredLocations {
    pub group_id: GroupId,
    pub location_ids: Vec<LocationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub required_locations: Vec<RequiredLocations>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}
