//! Redis-backed cancellation for multi-replica deployments.
//!
//! A cancel is broadcast on a shared pub/sub channel for replicas currently
//! blocked in `cancelled`, and recorded under a short-lived marker key for
//! replicas that subscribe after the event fired.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{Error, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Canceller;
use crate::backend;

/// Channel on which cancelled stage ids are published, as decimal strings.
const CANCEL_CHANNEL: &str = "drone-cancel";
/// Prefix of the marker key recording a recent cancel.
const CANCEL_KEY_PREFIX: &str = "drone-cancel-";
/// Value stored under the marker key.
const CANCEL_VALUE: &str = "canceled";

/// Tracks cancellation requests through a shared Redis instance.
pub struct RedisCanceller {
    client: redis::Client,
    ttl: Duration,
}

impl RedisCanceller {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(id: i64) -> String {
        format!("{CANCEL_KEY_PREFIX}{id}")
    }
}

#[async_trait]
impl Canceller for RedisCanceller {
    async fn cancel(&self, id: i64) -> Result<()> {
        debug!(stage_id = id, "stage cancelled");
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        // Publish first so replicas blocked in `cancelled` wake immediately;
        // the marker key covers replicas that subscribe afterwards.
        let _: () = conn
            .publish(CANCEL_CHANNEL, id.to_string())
            .await
            .map_err(backend)?;
        let _: () = conn
            .set_ex(Self::key(id), CANCEL_VALUE, self.ttl.as_secs())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn cancelled(&self, ctx: &CancellationToken, id: i64) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let marker: Option<String> = conn.get(Self::key(id)).await.map_err(backend)?;
        if marker.as_deref() == Some(CANCEL_VALUE) {
            return Ok(true);
        }

        // Subscription closes on every exit path when the pubsub connection
        // drops at the end of this scope.
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(CANCEL_CHANNEL).await.map_err(backend)?;
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::Backend("cancel subscription closed".to_string()));
                    };
                    let payload: String = msg.get_payload().map_err(backend)?;
                    if payload.parse::<i64>().is_ok_and(|published| published == id) {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    #[ignore = "requires a local redis server"]
    async fn test_cancel_wakes_subscribed_waiter() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let canceller = Arc::new(RedisCanceller::new(client, TTL));
        let ctx = CancellationToken::new();

        let task = tokio::spawn({
            let canceller = canceller.clone();
            let ctx = ctx.clone();
            async move { canceller.cancelled(&ctx, 9001).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        canceller.cancel(9001).await.unwrap();
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a local redis server"]
    async fn test_cancel_before_wait_found_by_marker() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let canceller = RedisCanceller::new(client, TTL);
        let ctx = CancellationToken::new();

        canceller.cancel(9002).await.unwrap();
        assert!(canceller.cancelled(&ctx, 9002).await.unwrap());
    }
}
