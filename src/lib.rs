pub mod compactor;
pub mod config;
pub mod engine;
pub mod http;
pub mod limits;
pub mod lock;
pub mod model;
pub mod observability;
pub mod planner;
pub mod provenance;
pub mod revision;
pub mod solver;
pub mod transfer;
pub mod wal;
