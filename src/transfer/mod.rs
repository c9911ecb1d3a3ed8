pub mod allocate;
pub mod export;
pub mod import;
pub mod snapshot;

pub use allocate::{plan, run_allocation, AllocateReport, AllocateRequest};
pub use export::{build_snapshot, export, ExportIssue, ExportRequest};
pub use import::{import, ImportOptions, ImportPayload, ImportReport, ImportSummary, RowConflict};
pub use snapshot::{Snapshot, SNAPSHOT_SCHEMA};
