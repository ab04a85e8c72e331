//! Scheduler trait and agent capability filters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::{Result, Stage};

/// An agent's capability announcement, supplied on every `request` call.
///
/// Same shape as the platform and label fields of [`Stage`]; empty fields
/// mean "unconstrained".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub kind: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub variant: String,
    pub labels: HashMap<String, String>,
}

/// The scheduling interface exposed to the transport layer.
///
/// `request` and `cancelled` block until satisfied or until the caller's
/// token is cancelled, in which case they return [`Error::Canceled`]. All
/// other operations return promptly.
///
/// [`Error::Canceled`]: crate::Error::Canceled
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Signal that a stage has become eligible for dispatch. At-least-once
    /// wake-up semantics; never blocks.
    async fn schedule(&self, stage: Stage) -> Result<()>;

    /// Block until a stage matching the filter is assigned to the caller.
    async fn request(&self, ctx: &CancellationToken, filter: Filter) -> Result<Stage>;

    /// Mark the stage as cancelled and notify every waiter, across all
    /// server replicas.
    async fn cancel(&self, id: i64) -> Result<()>;

    /// Block until the stage is cancelled. Returns `Ok(true)` when a cancel
    /// is observed, including cancels issued shortly before the call.
    async fn cancelled(&self, ctx: &CancellationToken, id: i64) -> Result<bool>;

    /// Stop handing out work until `resume` is called.
    async fn pause(&self) -> Result<()>;

    async fn paused(&self) -> Result<bool>;

    /// Allow dispatch again and trigger an immediate scan.
    async fn resume(&self) -> Result<()>;

    /// Diagnostic snapshot of scheduler internals. Not implemented yet;
    /// returns [`Error::NotImplemented`] rather than fabricated data.
    ///
    /// [`Error::NotImplemented`]: crate::Error::NotImplemented
    async fn stats(&self) -> Result<serde_json::Value>;
}
