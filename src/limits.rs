/// Assignment rows accepted by a single import.
pub const MAX_IMPORT_ROWS: usize = 20_000;

/// Schedule items accepted by a single batch replace.
pub const MAX_SCHEDULES_PER_REPLACE: usize = 2_000;

/// Widest date window for export, import scope and allocation.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Groups accepted in one export/allocation selection.
pub const MAX_SELECTED_GROUPS: usize = 5_000;

/// Preference hints accepted per allocation request.
pub const MAX_HINTS: usize = 10_000;

/// Participants on one assignment or one group.
pub const MAX_PARTICIPANTS: u32 = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TAG_LEN: usize = 256;

/// Finished solver runs kept in the store; older ones are dropped.
pub const MAX_RETAINED_RUNS: usize = 200;

/// Solver runs waiting behind the active one.
pub const MAX_QUEUED_RUNS: usize = 16;
