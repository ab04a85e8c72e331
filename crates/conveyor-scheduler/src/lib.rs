//! Build stage scheduling for the Conveyor CI server.
//!
//! Matches pending stages against remote agents long-polling for work,
//! enforces per-repository concurrency limits, and propagates cancellation
//! signals across a horizontally-scaled server fleet through Redis.

pub mod canceller;
pub mod config;
pub mod lock;
pub mod queue;

pub use config::SchedulerConfig;
pub use queue::StageQueue;

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_core::{Error, Filter, Result, Scheduler, Stage, StageStore};
use tokio_util::sync::CancellationToken;

use crate::canceller::{Canceller, MemoryCanceller, RedisCanceller};
use crate::lock::{NoopLock, RedisLock, ScanLock};

pub(crate) fn backend(err: redis::RedisError) -> Error {
    Error::Backend(err.to_string())
}

/// Composes one [`StageQueue`] and one cancellation backend behind the
/// [`Scheduler`] trait. Pure composition; owns no additional state and
/// performs no additional locking.
pub struct StageScheduler {
    queue: StageQueue,
    canceller: Arc<dyn Canceller>,
}

impl StageScheduler {
    /// Build a scheduler from configuration. This is the only place backend
    /// selection happens: with a Redis endpoint configured, cancellation and
    /// the scan lock coordinate across replicas; without one, both are
    /// in-process.
    pub fn new(
        ctx: CancellationToken,
        store: Arc<dyn StageStore>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let (canceller, lock): (Arc<dyn Canceller>, Arc<dyn ScanLock>) = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str()).map_err(backend)?;
                let lock = RedisLock::new(client.clone(), &config.lock_name, config.lock_expiry)
                    .with_retry(config.lock_retry_delay, config.lock_retry_attempts);
                (
                    Arc::new(RedisCanceller::new(client, config.cancel_ttl)),
                    Arc::new(lock),
                )
            }
            None => (
                Arc::new(MemoryCanceller::new(config.cancel_ttl)),
                Arc::new(NoopLock),
            ),
        };
        let queue = StageQueue::new(ctx, store, lock, config.scan_interval);
        Ok(Self { queue, canceller })
    }
}

#[async_trait]
impl Scheduler for StageScheduler {
    async fn schedule(&self, stage: Stage) -> Result<()> {
        self.queue.schedule(&stage);
        Ok(())
    }

    async fn request(&self, ctx: &CancellationToken, filter: Filter) -> Result<Stage> {
        self.queue.request(ctx, filter).await
    }

    async fn cancel(&self, id: i64) -> Result<()> {
        self.canceller.cancel(id).await
    }

    async fn cancelled(&self, ctx: &CancellationToken, id: i64) -> Result<bool> {
        self.canceller.cancelled(ctx, id).await
    }

    async fn pause(&self) -> Result<()> {
        self.queue.pause();
        Ok(())
    }

    async fn paused(&self) -> Result<bool> {
        Ok(self.queue.paused())
    }

    async fn resume(&self) -> Result<()> {
        self.queue.resume();
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        Err(Error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EmptyStore;

    #[async_trait]
    impl StageStore for EmptyStore {
        async fn list_incomplete(&self) -> Result<Vec<Stage>> {
            Ok(Vec::new())
        }
    }

    struct SingleStageStore;

    #[async_trait]
    impl StageStore for SingleStageStore {
        async fn list_incomplete(&self) -> Result<Vec<Stage>> {
            Ok(vec![Stage {
                id: 1,
                os: "linux".to_string(),
                arch: "amd64".to_string(),
                ..Stage::default()
            }])
        }
    }

    fn new_scheduler(store: Arc<dyn StageStore>) -> StageScheduler {
        StageScheduler::new(
            CancellationToken::new(),
            store,
            SchedulerConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stats_not_implemented() {
        let scheduler = new_scheduler(Arc::new(EmptyStore));
        assert!(matches!(
            scheduler.stats().await,
            Err(Error::NotImplemented)
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_roundtrip() {
        let scheduler = new_scheduler(Arc::new(EmptyStore));
        assert!(!scheduler.paused().await.unwrap());
        scheduler.pause().await.unwrap();
        assert!(scheduler.paused().await.unwrap());
        scheduler.resume().await.unwrap();
        assert!(!scheduler.paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_request_through_facade() {
        let scheduler = new_scheduler(Arc::new(SingleStageStore));
        let ctx = CancellationToken::new();
        let filter = Filter {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            ..Filter::default()
        };
        let stage = scheduler.request(&ctx, filter).await.unwrap();
        assert_eq!(stage.id, 1);
    }

    #[tokio::test]
    async fn test_cancel_through_facade_uses_memory_backend() {
        let scheduler = Arc::new(new_scheduler(Arc::new(EmptyStore)));
        let ctx = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            async move { scheduler.cancelled(&ctx, 42).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.cancel(42).await.unwrap();
        assert!(task.await.unwrap().unwrap());
    }
}
