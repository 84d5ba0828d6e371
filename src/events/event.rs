//! Event records.

use crate::core::activity::ActivityId;
use crate::core::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation and reference data attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// The event that caused this one.
    #[serde(default)]
    pub causation_id: Option<EventId>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub activity_id: Option<ActivityId>,
    /// Root task of the project this event belongs to.
    #[serde(default)]
    pub project_id: Option<TaskId>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference a task and the activity currently recorded on it.
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: Some(task.id),
            activity_id: task.metadata.activity_id,
            ..Self::default()
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }

    pub fn in_project(mut self, root_id: TaskId) -> Self {
        self.project_id = Some(root_id);
        self
    }
}

/// An immutable record of a fact. Only `processed_at` changes, once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Dot-namespaced type, e.g. `subtask.completed`.
    pub event_type: String,
    pub data: Value,
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(event_type: &str, data: Value, metadata: EventMetadata) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.to_string(),
            data,
            metadata,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Payload field, treating `null` as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Payload field parsed as a task id.
    pub fn task_id_field(&self, name: &str) -> Option<TaskId> {
        self.str_field(name).and_then(|s| s.parse().ok())
    }

    /// The namespace before the first dot (`subtask` for `subtask.completed`).
    pub fn namespace(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(ns, _)| ns)
            .unwrap_or(&self.event_type)
    }
}
