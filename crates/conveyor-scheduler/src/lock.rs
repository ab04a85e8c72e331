//! Mutual exclusion around dispatch scans.
//!
//! In multi-replica deployments a named Redis lock keeps two server
//! processes from racing to hand the same stage to two different agents.
//! Single-instance deployments use the no-op variant.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{Error, Result};
use tokio::time::sleep;
use uuid::Uuid;

use crate::backend;

/// Guards one full dispatch scan. `acquire` returns an opaque fencing token
/// that must be passed back to `release`.
#[async_trait]
pub trait ScanLock: Send + Sync {
    async fn acquire(&self) -> Result<String>;
    async fn release(&self, token: String) -> Result<()>;
}

/// Lock for single-instance deployments; always succeeds.
pub struct NoopLock;

#[async_trait]
impl ScanLock for NoopLock {
    async fn acquire(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn release(&self, _token: String) -> Result<()> {
        Ok(())
    }
}

// Deletes the key only while it still holds the caller's token, so an
// expired lock re-acquired by another replica is never released from here.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

/// Named Redis lock with expiry, taken with `SET NX PX` and retried a
/// bounded number of times before surfacing an acquisition error.
pub struct RedisLock {
    client: redis::Client,
    name: String,
    expiry: Duration,
    retry_delay: Duration,
    retry_attempts: u32,
}

impl RedisLock {
    pub fn new(client: redis::Client, name: impl Into<String>, expiry: Duration) -> Self {
        Self {
            client,
            name: name.into(),
            expiry,
            retry_delay: Duration::from_millis(250),
            retry_attempts: 32,
        }
    }

    pub fn with_retry(mut self, delay: Duration, attempts: u32) -> Self {
        self.retry_delay = delay;
        self.retry_attempts = attempts;
        self
    }
}

#[async_trait]
impl ScanLock for RedisLock {
    async fn acquire(&self) -> Result<String> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let token = Uuid::new_v4().to_string();
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                sleep(self.retry_delay).await;
            }
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.expiry.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if acquired.is_some() {
                return Ok(token);
            }
        }
        Err(Error::Backend(format!(
            "could not acquire lock {}",
            self.name
        )))
    }

    async fn release(&self, token: String) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
