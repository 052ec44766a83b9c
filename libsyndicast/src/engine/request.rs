//! Request and response types for the dispatch engine

use serde::{Deserialize, Serialize};

use crate::scheduler::QueueDepths;
use crate::types::{PlatformHealthRecord, Priority, PublicationTask, TaskPayload, TaskStatus};

/// A publish request for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub platform: String,
    pub payload: TaskPayload,
    /// Unix seconds; absent or past means now
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    /// Defaults to `engine.default_max_attempts`
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub priority: Priority,
}

impl SubmitRequest {
    pub fn new(platform: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            platform: platform.into(),
            payload,
            scheduled_at: None,
            max_attempts: None,
            priority: Priority::Normal,
        }
    }

    pub fn scheduled_at(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted {
        task_id: String,
        status: TaskStatus,
    },
    /// `task_id` is set when the rejected task was recorded
    Rejected {
        task_id: Option<String>,
        reason: String,
    },
}

impl SubmitOutcome {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted { task_id, .. } => Some(task_id),
            SubmitOutcome::Rejected { task_id, .. } => task_id.as_deref(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

/// A task as seen by callers
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: PublicationTask,
    /// Whether a publish timer is armed for the task
    pub timer_armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
    Maintenance,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Running => "running",
            EngineState::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters since the engine was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerfSnapshot {
    pub submitted: u64,
    pub posted: u64,
    pub failed: u64,
    pub retries: u64,
    pub in_flight: usize,
    pub avg_publish_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub engine_state: EngineState,
    pub platforms: Vec<PlatformHealthRecord>,
    pub queue_depths: QueueDepths,
    pub open_alerts: usize,
    pub perf: PerfSnapshot,
}

/// What `start` found in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Scheduled or Retrying tasks with a timer re-armed
    pub rearmed: usize,
    /// Tasks found mid-publish
    pub interrupted: usize,
    /// Posted tasks with analytics sampling re-armed
    pub analytics: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_defaults() {
        let request: SubmitRequest = serde_json::from_str(
            r#"{"platform":"blog","payload":{"title":"Hello","body":"World"}}"#,
        )
        .unwrap();

        assert_eq!(request.platform, "blog");
        assert_eq!(request.scheduled_at, None);
        assert_eq!(request.max_attempts, None);
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.payload.tags.is_empty());
    }

    #[test]
    fn test_outcome_json_shape() {
        let accepted = SubmitOutcome::Accepted {
            task_id: "t1".to_string(),
            status: TaskStatus::Scheduled,
        };
        let json = serde_json::to_value(&accepted).unwrap();
        assert_eq!(json["outcome"], "accepted");
        assert_eq!(json["status"], "scheduled");

        let rejected = SubmitOutcome::Rejected {
            task_id: None,
            reason: "engine is not running".to_string(),
        };
        assert!(!rejected.is_accepted());
        assert_eq!(rejected.task_id(), None);
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert!(json["task_id"].is_null());
    }
}
