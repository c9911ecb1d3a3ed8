//! REST surface over the plan store.
//!
//! Handlers parse requests, resolve the caller identity, take the edit lock
//! for mutations and delegate to the engine and transfer pipelines.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod router;
pub mod state;

pub use router::create_router;
pub use state::AppState;
