//! In-memory stage dispatcher.
//!
//! One dispatch loop task runs per queue. It wakes on a debounced signal or
//! a fallback interval, lists incomplete stages from the store, and greedily
//! matches eligible stages to agents blocked in [`StageQueue::request`]. The
//! matcher is single-pass and best-effort: it guarantees correctness (no
//! over-limit dispatch, no double dispatch) and eventual progress, not
//! optimal assignment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_core::{Error, Filter, Result, Stage, StageStatus, StageStore};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lock::ScanLock;

/// Bookkeeping for one blocked `request` call: the caller's capability
/// filter plus a one-shot hand-off for the matched stage.
struct Worker {
    kind: String,
    r#type: String,
    os: String,
    arch: String,
    kernel: String,
    variant: String,
    labels: HashMap<String, String>,
    tx: oneshot::Sender<Stage>,
}

impl Worker {
    fn matches(&self, stage: &Stage) -> bool {
        if !match_resource(&self.kind, &self.r#type, &stage.kind, &stage.r#type) {
            return false;
        }
        // Platform constraints apply only when the worker declared a
        // platform; an unconstrained worker takes anything.
        if !self.os.is_empty()
            || !self.arch.is_empty()
            || !self.variant.is_empty()
            || !self.kernel.is_empty()
        {
            if self.os != stage.os {
                return false;
            }
            if self.arch != stage.arch {
                return false;
            }
            // A stage variant must match the worker variant (e.g. arm6, arm7).
            if !stage.variant.is_empty() && stage.variant != self.variant {
                return false;
            }
            // A stage kernel version must match the worker kernel (e.g. 1709, 1803).
            if !stage.kernel.is_empty() && stage.kernel != self.kernel {
                return false;
            }
        }
        if !stage.labels.is_empty() || !self.labels.is_empty() {
            if !match_labels(&stage.labels, &self.labels) {
                return false;
            }
        }
        true
    }
}

struct QueueState {
    paused: bool,
    next_worker: u64,
    workers: HashMap<u64, Worker>,
}

struct QueueInner {
    store: Arc<dyn StageStore>,
    lock: Arc<dyn ScanLock>,
    interval: Duration,
    ready: mpsc::Sender<()>,
    state: Mutex<QueueState>,
}

/// In-memory dispatcher matching incomplete stages against polling agents.
#[derive(Clone)]
pub struct StageQueue {
    inner: Arc<QueueInner>,
}

impl StageQueue {
    /// Create the queue and spawn its dispatch loop. The loop runs until
    /// `ctx` is cancelled.
    pub fn new(
        ctx: CancellationToken,
        store: Arc<dyn StageStore>,
        lock: Arc<dyn ScanLock>,
        interval: Duration,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let inner = Arc::new(QueueInner {
            store,
            lock,
            interval,
            ready: ready_tx,
            state: Mutex::new(QueueState {
                paused: false,
                next_worker: 0,
                workers: HashMap::new(),
            }),
        });
        tokio::spawn(run(inner.clone(), ready_rx, ctx));
        Self { inner }
    }

    /// Record that the dispatch loop should re-scan soon. Multiple calls
    /// before the loop wakes collapse into a single scan.
    pub fn schedule(&self, stage: &Stage) {
        debug!(stage_id = stage.id, stage = %stage.name, "stage scheduled");
        self.inner.signal();
    }

    /// Stop handing out work until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.inner.state.lock().expect("queue lock poisoned").paused = true;
    }

    pub fn paused(&self) -> bool {
        self.inner.state.lock().expect("queue lock poisoned").paused
    }

    /// Allow dispatch again and trigger an immediate scan.
    pub fn resume(&self) {
        self.inner.state.lock().expect("queue lock poisoned").paused = false;
        self.inner.signal();
    }

    /// Block until a stage matching the filter is assigned to the caller, or
    /// the token fires. Cancellation deregisters the caller's worker record;
    /// no state is leaked.
    pub async fn request(&self, ctx: &CancellationToken, filter: Filter) -> Result<Stage> {
        let (tx, rx) = oneshot::channel();
        let key = self.inner.register(filter, tx);
        self.inner.signal();
        tokio::select! {
            _ = ctx.cancelled() => {
                self.inner.deregister(key);
                Err(Error::Canceled)
            }
            stage = rx => stage.map_err(|_| Error::Canceled),
        }
    }
}

async fn run(inner: Arc<QueueInner>, mut ready: mpsc::Receiver<()>, ctx: CancellationToken) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            signal = ready.recv() => {
                if signal.is_none() {
                    return;
                }
            }
            // Self-heal from missed signals rather than starving the queue.
            _ = tokio::time::sleep(inner.interval) => {}
        }
        if let Err(err) = inner.process().await {
            warn!(error = %err, "stage scan failed");
        }
    }
}

impl QueueInner {
    /// Non-blocking, drop-if-full. A slow store read must never block the
    /// producer side.
    fn signal(&self) {
        let _ = self.ready.try_send(());
    }

    fn register(&self, filter: Filter, tx: oneshot::Sender<Stage>) -> u64 {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let key = state.next_worker;
        state.next_worker += 1;
        state.workers.insert(
            key,
            Worker {
                kind: filter.kind,
                r#type: filter.r#type,
                os: filter.os,
                arch: filter.arch,
                kernel: filter.kernel,
                variant: filter.variant,
                labels: filter.labels,
                tx,
            },
        );
        key
    }

    fn deregister(&self, key: u64) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .workers
            .remove(&key);
    }

    /// One scan: take the distributed lock, match stages to workers, release
    /// the lock even when the scan fails.
    async fn process(&self) -> Result<()> {
        let token = self.lock.acquire().await?;
        let result = self.dispatch().await;
        if let Err(err) = self.lock.release(token).await {
            warn!(error = %err, "scan lock release failed");
        }
        result
    }

    async fn dispatch(&self) -> Result<()> {
        {
            let state = self.state.lock().expect("queue lock poisoned");
            if state.paused || state.workers.is_empty() {
                return Ok(());
            }
        }

        let items = self.store.list_incomplete().await?;

        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.paused {
            return Ok(());
        }
        for item in &items {
            if item.status == StageStatus::Running {
                continue;
            }
            if item.is_claimed() {
                continue;
            }
            if !within_limits(item, &items) {
                continue;
            }
            if should_throttle(item, &items, item.limit_repo) {
                continue;
            }

            loop {
                let matched = state
                    .workers
                    .iter()
                    .find_map(|(key, worker)| worker.matches(item).then_some(*key));
                let Some(key) = matched else { break };
                let worker = state
                    .workers
                    .remove(&key)
                    .expect("matched worker missing from pool");
                match worker.tx.send(item.clone()) {
                    Ok(()) => {
                        debug!(stage_id = item.id, stage = %item.name, "dispatching stage");
                        break;
                    }
                    // The requester gave up between scans; drop its record
                    // and keep looking for another worker for this stage.
                    Err(_) => continue,
                }
            }
        }
        Ok(())
    }
}

/// Resource classes match after defaulting empty kinds and types on both
/// sides.
fn match_resource(kind_a: &str, type_a: &str, kind_b: &str, type_b: &str) -> bool {
    let kind_a = if kind_a.is_empty() { "pipeline" } else { kind_a };
    let kind_b = if kind_b.is_empty() { "pipeline" } else { kind_b };
    let type_a = if type_a.is_empty() { "docker" } else { type_a };
    let type_b = if type_b.is_empty() { "docker" } else { type_b };
    kind_a == kind_b && type_a == type_b
}

/// Label sets must be exactly equal, not a subset in either direction.
fn match_labels(a: &HashMap<String, String>, b: &HashMap<String, String>) -> bool {
    a == b
}

/// Enforces the stage's own `limit`: siblings with the same repository and
/// name occupy a slot when they are running or were created earlier.
fn within_limits(stage: &Stage, siblings: &[Stage]) -> bool {
    if stage.limit <= 0 {
        return true;
    }
    let mut count = 0;
    for sibling in siblings {
        if sibling.repo_id != stage.repo_id {
            continue;
        }
        if sibling.id == stage.id {
            continue;
        }
        if sibling.name != stage.name {
            continue;
        }
        if sibling.id < stage.id || sibling.status == StageStatus::Running {
            count += 1;
        }
    }
    count < stage.limit
}

/// Enforces the repository-wide `limit_repo`: a pending stage waits while
/// enough earlier-created siblings are still incomplete. Running stages are
/// never throttled, only delayed before dispatch.
fn should_throttle(stage: &Stage, siblings: &[Stage], limit: i64) -> bool {
    if limit <= 0 {
        return false;
    }
    if stage.status == StageStatus::Running {
        return false;
    }
    let mut count = 0;
    for sibling in siblings {
        if sibling.repo_id != stage.repo_id {
            continue;
        }
        if sibling.id >= stage.id {
            continue;
        }
        count += 1;
    }
    count >= limit
}
