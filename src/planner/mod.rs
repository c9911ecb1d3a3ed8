pub mod allocation;
pub mod capacity;
pub mod constraint;
pub mod validator;

pub use allocation::{allocate, Allocation, AllocationInput, PreferenceHint, Unplaced};
pub use capacity::CapacityTracker;
pub use validator::{
    validate, Conflict, ConflictKind, ConflictList, DuplicateGuard, ProposedAssignment, Severity,
    ValidationContext,
};
