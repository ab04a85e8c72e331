//! In-process cancellation backend for single-instance deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{Error, Result};
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Canceller;

/// Interval at which a blocked waiter re-checks the cancellation map. This
/// covers cancels that landed before the waiter registered.
const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

struct Subscriber {
    stage_id: i64,
    tx: oneshot::Sender<()>,
}

struct CancellerState {
    next_subscriber: u64,
    subscribers: HashMap<u64, Subscriber>,
    cancelled: HashMap<i64, Instant>,
}

impl CancellerState {
    /// Cancelled entries are kept for a grace window so waiters with
    /// connectivity issues can reconnect and still observe the cancel.
    /// Expired entries are collected opportunistically on each cancel.
    fn collect(&mut self) {
        let now = Instant::now();
        self.cancelled.retain(|_, expiry| *expiry > now);
    }
}

/// Tracks cancellation requests in process memory.
pub struct MemoryCanceller {
    ttl: Duration,
    state: Mutex<CancellerState>,
}

impl MemoryCanceller {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CancellerState {
                next_subscriber: 0,
                subscribers: HashMap::new(),
                cancelled: HashMap::new(),
            }),
        }
    }

    async fn wait(&self, ctx: &CancellationToken, id: i64, mut rx: &mut oneshot::Receiver<()>) -> Result<bool> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                _ = sleep(RECHECK_INTERVAL) => {
                    let state = self.state.lock().expect("canceller lock poisoned");
                    if state.cancelled.contains_key(&id) {
                        return Ok(true);
                    }
                }
                _ = &mut rx => return Ok(true),
            }
        }
    }
}

#[async_trait]
impl Canceller for MemoryCanceller {
    async fn cancel(&self, id: i64) -> Result<()> {
        debug!(stage_id = id, "stage cancelled");
        let mut state = self.state.lock().expect("canceller lock poisoned");
        state.cancelled.insert(id, Instant::now() + self.ttl);
        let woken: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, sub)| sub.stage_id == id)
            .map(|(key, _)| *key)
            .collect();
        for key in woken {
            if let Some(sub) = state.subscribers.remove(&key) {
                let _ = sub.tx.send(());
            }
        }
        state.collect();
        Ok(())
    }

    async fn cancelled(&self, ctx: &CancellationToken, id: i64) -> Result<bool> {
        let (tx, mut rx) = oneshot::channel();
        let key = {
            let mut state = self.state.lock().expect("canceller lock poisoned");
            let key = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(key, Subscriber { stage_id: id, tx });
            key
        };

        let result = self.wait(ctx, id, &mut rx).await;
        self.state
            .lock()
            .expect("canceller lock poisoned")
            .subscribers
            .remove(&key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::advance;

    const TTL: Duration = Duration::from_secs(300);

    fn subscriber_count(canceller: &MemoryCanceller) -> usize {
        canceller.state.lock().unwrap().subscribers.len()
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_waiter() {
        let canceller = Arc::new(MemoryCanceller::new(TTL));
        let ctx = CancellationToken::new();

        let task = tokio::spawn({
            let canceller = canceller.clone();
            let ctx = ctx.clone();
            async move { canceller.cancelled(&ctx, 7).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subscriber_count(&canceller), 1);

        canceller.cancel(7).await.unwrap();
        assert!(task.await.unwrap().unwrap());
        assert_eq!(subscriber_count(&canceller), 0);
    }

    #[tokio::test]
    async fn test_cancel_does_not_wake_other_ids() {
        let canceller = Arc::new(MemoryCanceller::new(TTL));
        let ctx = CancellationToken::new();

        let task = tokio::spawn({
            let canceller = canceller.clone();
            let ctx = ctx.clone();
            async move { canceller.cancelled(&ctx, 7).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        canceller.cancel(8).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_wait_found_by_recheck() {
        let canceller = Arc::new(MemoryCanceller::new(TTL));
        let ctx = CancellationToken::new();

        canceller.cancel(7).await.unwrap();

        let task = tokio::spawn({
            let canceller = canceller.clone();
            let ctx = ctx.clone();
            async move { canceller.cancelled(&ctx, 7).await }
        });
        // the subscriber channel never fires for an already-recorded cancel;
        // the periodic re-check discovers it once the paused clock advances.
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_context_cancel_cleans_up_subscriber() {
        let canceller = Arc::new(MemoryCanceller::new(TTL));
        let ctx = CancellationToken::new();

        let task = tokio::spawn({
            let canceller = canceller.clone();
            let ctx = ctx.clone();
            async move { canceller.cancelled(&ctx, 7).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subscriber_count(&canceller), 1);

        ctx.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
        assert_eq!(subscriber_count(&canceller), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_expires_old_entries() {
        let canceller = MemoryCanceller::new(TTL);
        canceller.cancel(1).await.unwrap();

        advance(TTL + Duration::from_secs(1)).await;
        // any cancel triggers collection of expired entries.
        canceller.cancel(2).await.unwrap();

        let state = canceller.state.lock().unwrap();
        assert!(!state.cancelled.contains_key(&1));
        assert!(state.cancelled.contains_key(&2));
    }
}
