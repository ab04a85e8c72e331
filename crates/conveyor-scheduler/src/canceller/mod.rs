//! Cancellation tracking across one or many server replicas.

pub mod memory;
pub mod redis;

pub use memory::MemoryCanceller;
pub use redis::RedisCanceller;

use async_trait::async_trait;
use conveyor_core::Result;
use tokio_util::sync::CancellationToken;

/// Capability contract shared by the cancellation backends. Callers stay
/// agnostic to which backend is active; the facade constructor is the only
/// place that picks one.
#[async_trait]
pub trait Canceller: Send + Sync {
    /// Record the stage as cancelled and wake every waiter for that id.
    async fn cancel(&self, id: i64) -> Result<()>;

    /// Block until the stage is cancelled or the token fires. Cancels issued
    /// shortly before the call are still observed.
    async fn cancelled(&self, ctx: &CancellationToken, id: i64) -> Result<bool>;
}
