use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for lock and run bookkeeping.
pub type Ms = i64;

pub type GroupId = i64;
pub type LocationId = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Inclusive calendar range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `end` precedes `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn intersects(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Slot {
    Morning,
    Afternoon,
    Evening,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Morning, Slot::Afternoon, Slot::Evening];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Morning => "MORNING",
            Slot::Afternoon => "AFTERNOON",
            Slot::Evening => "EVENING",
        }
    }

    /// Case-insensitive parse; unknown names are `None`.
    pub fn parse(s: &str) -> Option<Slot> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MORNING" => Some(Slot::Morning),
            "AFTERNOON" => Some(Slot::Afternoon),
            "EVENING" => Some(Slot::Evening),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open clock window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn hm(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        Self::new(t(start_h, start_m), t(end_h, end_m))
    }

    pub fn contains_time(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_window(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub slot: Slot,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Clock windows for the three slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinitions {
    pub morning: TimeWindow,
    pub afternoon: TimeWindow,
    pub evening: TimeWindow,
}

impl Default for SlotDefinitions {
    fn default() -> Self {
        Self {
            morning: TimeWindow::hm(8, 0, 12, 0),
            afternoon: TimeWindow::hm(13, 0, 17, 0),
            evening: TimeWindow::hm(18, 0, 21, 0),
        }
    }
}

impl SlotDefinitions {
    pub fn window(&self, slot: Slot) -> TimeWindow {
        match slot {
            Slot::Morning => self.morning,
            Slot::Afternoon => self.afternoon,
            Slot::Evening => self.evening,
        }
    }

    /// The slot whose window contains `t`, if any.
    pub fn slot_for_time(&self, t: NaiveTime) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .find(|s| self.window(*s).contains_time(t))
    }

    pub fn to_list(&self) -> Vec<SlotDefinition> {
        Slot::ALL
            .into_iter()
            .map(|slot| {
                let w = self.window(slot);
                SlotDefinition { slot, start: w.start, end: w.end }
            })
            .collect()
    }
}

// ── Weekday sets ─────────────────────────────────────────────────

/// Set of weekdays stored as a bitmask (bit 0 = Monday).
///
/// Human-readable formats (JSON) read either a list or a delimited string and
/// write a list of ISO numbers (1 = Monday .. 7 = Sunday). `0` is accepted as
/// Sunday. Binary formats store the raw mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        let mut set = Self::empty();
        for d in days {
            set.insert(*d);
        }
        set
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        (0..7u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .filter_map(|i| Weekday::try_from(i).ok())
    }

    /// Parse a delimited string such as `"0,6"`, `"1;7"` or `"mon sat"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut set = Self::empty();
        for token in s
            .split([',', ';', '|', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            set.insert(parse_weekday_token(token)?);
        }
        Ok(set)
    }
}

fn weekday_from_number(n: i64) -> Result<Weekday, String> {
    match n {
        0 | 7 => Ok(Weekday::Sun),
        1..=6 => Weekday::try_from((n - 1) as u8).map_err(|e| e.to_string()),
        _ => Err(format!("weekday number out of range: {n}")),
    }
}

fn parse_weekday_token(token: &str) -> Result<Weekday, String> {
    if let Ok(n) = token.parse::<i64>() {
        return weekday_from_number(n);
    }
    token
        .parse::<Weekday>()
        .map_err(|_| format!("unknown weekday: {token}"))
}

impl Serialize for WeekdaySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return serializer.serialize_u8(self.0);
        }
        let days: Vec<u32> = self.iter().map(|d| d.number_from_monday()).collect();
        let mut seq = serializer.serialize_seq(Some(days.len()))?;
        for d in days {
            seq.serialize_element(&d)?;
        }
        seq.end()
    }
}

struct WeekdaySetVisitor;

impl<'de> Visitor<'de> for WeekdaySetVisitor {
    type Value = WeekdaySet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of weekdays or a delimited weekday string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<WeekdaySet, E> {
        WeekdaySet::parse(v).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<WeekdaySet, E> {
        Ok(WeekdaySet::empty())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WeekdaySet, A::Error> {
        let mut set = WeekdaySet::empty();
        while let Some(item) = seq.next_element::<serde_json::Value>()? {
            let day = match &item {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| format!("invalid weekday: {n}"))
                    .and_then(weekday_from_number),
                serde_json::Value::String(s) => parse_weekday_token(s.trim()),
                other => Err(format!("invalid weekday: {other}")),
            };
            set.insert(day.map_err(de::Error::custom)?);
        }
        Ok(set)
    }
}

impl<'de> Deserialize<'de> for WeekdaySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(WeekdaySetVisitor)
        } else {
            u8::deserialize(deserializer).map(WeekdaySet)
        }
    }
}

/// Opening windows per weekday, with a default for days without their own entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHours {
    #[serde(default)]
    pub default: Vec<TimeWindow>,
    #[serde(default)]
    pub by_weekday: HashMap<Weekday, Vec<TimeWindow>>,
}

impl OpenHours {
    pub fn is_configured(&self) -> bool {
        !self.default.is_empty() || self.by_weekday.values().any(|w| !w.is_empty())
    }

    /// Windows that apply on `day`; `None` means no restriction for that day.
    pub fn windows_for(&self, day: Weekday) -> Option<&[TimeWindow]> {
        match self.by_weekday.get(&day) {
            Some(w) if !w.is_empty() => Some(w),
            _ if !self.default.is_empty() => Some(&self.default),
            _ => None,
        }
    }
}

// ── Groups and locations ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Primary,
    Secondary,
    Vip,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Primary => "primary",
            GroupType::Secondary => "secondary",
            GroupType::Vip => "vip",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStatus {
    #[default]
    Preparing,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub student_count: u32,
    #[serde(default)]
    pub teacher_count: u32,
    #[serde(default)]
    pub itinerary_plan_id: Option<i64>,
    #[serde(default)]
    pub must_visit: Vec<LocationId>,
    #[serde(default)]
    pub status: GroupStatus,
}

impl Group {
    pub fn participant_count(&self) -> u32 {
        self.student_count.saturating_add(self.teacher_count)
    }

    /// Date range of the trip. A reversed range collapses to its start date.
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date).unwrap_or(DateRange {
            start: self.start_date,
            end: self.start_date,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == GroupStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetGroups {
    #[default]
    All,
    Primary,
    Secondary,
    Vip,
}

impl TargetGroups {
    pub fn admits(&self, group_type: GroupType) -> bool {
        matches!(
            (self, group_type),
            (TargetGroups::All, _)
                | (TargetGroups::Primary, GroupType::Primary)
                | (TargetGroups::Secondary, GroupType::Secondary)
                | (TargetGroups::Vip, GroupType::Vip)
        )
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub blocked_weekdays: WeekdaySet,
    #[serde(default)]
    pub closed_dates: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub open_hours: OpenHours,
    #[serde(default)]
    pub target_groups: TargetGroups,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Location {
    pub fn weekday_blocked(&self, date: NaiveDate) -> bool {
        self.blocked_weekdays.contains(date.weekday())
    }
}

// ── Assignments and schedules ────────────────────────────────────

/// The atomic scheduling unit: one group at one location for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: Ulid,
    pub group_id: GroupId,
    pub location_id: LocationId,
    pub date: NaiveDate,
    #[serde(rename = "timeSlot")]
    pub slot: Slot,
    pub participant_count: u32,
    pub tag: String,
}

/// Calendar record mirrored 1:1 with an assignment (same id) or free-standing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Ulid,
    pub group_id: GroupId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub title: String,
    pub tag: String,
    pub location_id: Option<LocationId>,
}

// ── Identity and edit lock ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Planner,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "planner" => Some(Role::Planner),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Admin | Role::Planner)
    }
}

/// Caller identity as resolved by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self { username: username.into(), role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

impl LockRecord {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

// ── Solver runs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Left unfinished by a process restart.
    Lost,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Lost)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesSummary {
    pub assignments: usize,
    pub groups: usize,
    pub locations: usize,
    pub unplaced: usize,
}

/// Persisted record of a solver preview run. JSON payloads are kept as text so
/// the record stays encodable by the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Ulid,
    pub status: RunStatus,
    pub backend: String,
    pub request: String,
    pub created_at: Ms,
    pub started_at: Option<Ms>,
    pub finished_at: Option<Ms>,
    pub error: Option<String>,
    pub log_tail: String,
    pub result: Option<String>,
    pub summary: Option<CandidatesSummary>,
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types, flat with no nesting. A WAL frame carries one transaction,
/// i.e. a `Vec<Event>` applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GroupUpserted(Group),
    GroupStatusChanged { id: GroupId, status: GroupStatus },
    LocationUpserted(Location),
    AssignmentAdded(Assignment),
    AssignmentRemoved { id: Ulid },
    ScheduleAdded(Schedule),
    ScheduleRemoved { id: Ulid },
    RevisionSet { group_id: GroupId, revision: u64 },
    LockSet(Option<LockRecord>),
    RunRecorded(RunRecord),
}
