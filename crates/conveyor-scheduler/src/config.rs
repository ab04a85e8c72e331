//! Scheduler runtime configuration.

use std::time::Duration;

/// Runtime settings for the scheduler subsystem.
///
/// How these values are populated (flags, environment, config file) is the
/// hosting process's concern; this crate only consumes the resolved struct.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Redis endpoint for multi-replica coordination. When unset, the
    /// scheduler runs with in-process cancellation and no scan lock.
    pub redis_url: Option<String>,
    /// Fallback interval between dispatch scans, in addition to the
    /// event-driven wake-ups.
    pub scan_interval: Duration,
    /// How long a cancel is remembered for waiters that arrive late.
    pub cancel_ttl: Duration,
    /// Name of the distributed lock guarding each dispatch scan.
    pub lock_name: String,
    /// Expiry applied to the scan lock.
    pub lock_expiry: Duration,
    pub lock_retry_delay: Duration,
    pub lock_retry_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            scan_interval: Duration::from_secs(60),
            cancel_ttl: Duration::from_secs(300),
            lock_name: "conveyor-queue-lock".to_string(),
            lock_expiry: Duration::from_secs(30),
            lock_retry_delay: Duration::from_millis(250),
            lock_retry_attempts: 32,
        }
    }
}
