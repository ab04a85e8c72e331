//! Core domain types and traits for the Conveyor CI server.
//!
//! This crate contains:
//! - Stage and filter definitions used by the dispatch engine
//! - The `StageStore` trait consumed by the scheduler
//! - The `Scheduler` trait exposed to the transport layer

pub mod error;
pub mod scheduler;
pub mod stage;
pub mod store;

pub use error::{Error, Result};
pub use scheduler::{Filter, Scheduler};
pub use stage::{Stage, StageStatus};
pub use store::StageStore;
