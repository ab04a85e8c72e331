//! Storage abstraction consumed by the scheduler.

use async_trait::async_trait;

use crate::{Result, Stage};

/// Read access to the persistent stage store.
///
/// The store must be safe for concurrent access; the scheduler applies no
/// synchronization of its own beyond the optional distributed scan lock.
#[async_trait]
pub trait StageStore: Send + Sync {
    /// List every stage not yet in a terminal state (pending or running).
    async fn list_incomplete(&self) -> Result<Vec<Stage>>;
}
