//! Agent activities: one execution context per task-processing attempt.

use crate::core::task::{AgentKind, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub Uuid);

impl ActivityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ActivityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Running,
    Succeeded,
    Failed,
}

/// A run record. Activities form an ancestry chain through `parent_id`:
/// a coordinator's activity is the parent of every worker or
/// sub-coordinator activity it spawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    pub id: ActivityId,
    pub task_id: TaskId,
    pub agent: AgentKind,
    pub parent_id: Option<ActivityId>,
    /// Shared by every activity descending from the same root.
    pub correlation_id: Uuid,
    pub status: ActivityStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentActivity {
    /// Start a root activity (project kickoff).
    pub fn root(task_id: TaskId, agent: AgentKind) -> Self {
        let id = ActivityId::new();
        Self {
            id,
            task_id,
            agent,
            parent_id: None,
            correlation_id: id.0,
            status: ActivityStatus::Running,
            input_tokens: 0,
            output_tokens: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Start an activity spawned by `parent`.
    pub fn spawned_by(parent: &AgentActivity, task_id: TaskId, agent: AgentKind) -> Self {
        Self {
            parent_id: Some(parent.id),
            correlation_id: parent.correlation_id,
            ..Self::root(task_id, agent)
        }
    }

    pub fn record_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.input_tokens += u64::from(input_tokens);
        self.output_tokens += u64::from(output_tokens);
    }

    pub fn finish(&mut self, succeeded: bool) {
        self.status = if succeeded {
            ActivityStatus::Succeeded
        } else {
            ActivityStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn is_running(&self) -> bool {
        self.status == ActivityStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_activity_correlates_to_itself() {
        let activity = AgentActivity::root(TaskId::new(), AgentKind::Coordinator);
        assert_eq!(activity.correlation_id, activity.id.0);
        assert!(activity.parent_id.is_none());
        assert!(activity.is_running());
    }

    #[test]
    fn test_spawned_activity_inherits_correlation() {
        let root = AgentActivity::root(TaskId::new(), AgentKind::Coordinator);
        let child = AgentActivity::spawned_by(&root, TaskId::new(), AgentKind::Writer);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.correlation_id, root.correlation_id);
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn test_finish_and_usage() {
        let mut activity = AgentActivity::root(TaskId::new(), AgentKind::Writer);
        activity.record_usage(10, 5);
        activity.record_usage(1, 1);
        activity.finish(false);
        assert_eq!(activity.input_tokens, 11);
        assert_eq!(activity.output_tokens, 6);
        assert_eq!(activity.status, ActivityStatus::Failed);
        assert!(activity.finished_at.is_some());
    }
}
