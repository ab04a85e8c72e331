//! Stage definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A dispatchable unit of pipeline work.
///
/// Stages are created by pipeline compilation in `Pending` state and move to
/// `Running`/terminal states as agents execute them. The scheduler treats the
/// record as read-only; claiming (setting `machine`) happens through the
/// store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique identifier, monotonically increasing at creation.
    pub id: i64,
    /// Repository this stage belongs to.
    pub repo_id: i64,
    /// Build this stage belongs to.
    pub build_id: i64,
    /// Stage number within the build.
    pub number: i64,
    /// Logical pipeline stage name (e.g. "build").
    pub name: String,
    /// Resource kind an agent must support (empty = "pipeline").
    pub kind: String,
    /// Resource type an agent must support (empty = "docker").
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: StageStatus,
    /// Exit code of the stage process once finished.
    pub exit_code: i32,
    /// Agent that claimed this stage; `None` until claimed.
    pub machine: Option<String>,
    /// Target operating system (empty = unconstrained).
    pub os: String,
    /// Target architecture (empty = unconstrained).
    pub arch: String,
    /// Target platform variant, e.g. arm6, arm7 (empty = unconstrained).
    pub variant: String,
    /// Target kernel version, e.g. 1709, 1803 (empty = unconstrained).
    pub kernel: String,
    /// Max concurrent same-named stages per repository (0 = unlimited).
    pub limit: i64,
    /// Max concurrent stages of any name per repository (0 = unlimited).
    pub limit_repo: i64,
    /// Names of stages that must finish before this stage starts. Gating
    /// happens upstream of the queue; the field is carried for the store.
    pub depends_on: Vec<String>,
    /// Arbitrary agent affinity tags.
    pub labels: HashMap<String, String>,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    /// Optimistic locking counter, owned by the store.
    pub version: i64,
}

impl Stage {
    /// True once an agent has claimed the stage.
    pub fn is_claimed(&self) -> bool {
        self.machine.is_some()
    }
}

/// Execution state of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Killed,
    Error,
    Skipped,
    Blocked,
    Declined,
}

impl StageStatus {
    /// True when the stage has reached a terminal state. Only `Pending` and
    /// `Running` stages are considered incomplete by the store.
    pub fn is_done(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_done() {
        assert!(!StageStatus::Pending.is_done());
        assert!(!StageStatus::Running.is_done());
        assert!(StageStatus::Success.is_done());
        assert!(StageStatus::Failure.is_done());
        assert!(StageStatus::Killed.is_done());
        assert!(StageStatus::Error.is_done());
    }

    #[test]
    fn test_status_serde_rename() {
        let status: StageStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, StageStatus::Running);
        assert_eq!(
            serde_json::to_string(&StageStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn test_stage_claimed() {
        let mut stage = Stage::default();
        assert!(!stage.is_claimed());
        stage.machine = Some("agent-1".to_string());
        assert!(stage.is_claimed());
    }
}
