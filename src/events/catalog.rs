//! Stable event types and their default schemas.

use crate::core::{Task, TaskState};
use crate::events::schema::{EventSchema, SchemaRegistry};

pub const TASK_CREATED: &str = "task.created";
pub const TASK_ACTIVATED: &str = "task.activated";
pub const TASK_DECOMPOSED: &str = "task.decomposed";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_WAITING_ON_HUMAN: &str = "task.waiting_on_human";
pub const TASK_PAUSED: &str = "task.paused";
pub const TASK_RESUMED: &str = "task.resumed";

pub const SUBTASK_CREATED: &str = "subtask.created";
pub const SUBTASK_ASSIGNED: &str = "subtask.assigned";
pub const SUBTASK_DEFERRED: &str = "subtask.deferred";
pub const SUBTASK_COMPLETED: &str = "subtask.completed";
pub const SUBTASK_FAILED: &str = "subtask.failed";

pub const RECOVERY_DECIDED: &str = "recovery.decided";

pub const HUMAN_INTERACTION_REQUESTED: &str = "human_interaction.requested";
pub const HUMAN_INTERACTION_ANSWERED: &str = "human_interaction.answered";

/// Every built-in type with its schema.
pub fn default_schemas() -> Vec<(&'static str, EventSchema)> {
    vec![
        (
            TASK_CREATED,
            EventSchema::new(&["task_id", "title"], &["description", "priority"]),
        ),
        (TASK_ACTIVATED, EventSchema::new(&["task_id"], &["from"])),
        (
            TASK_DECOMPOSED,
            EventSchema::new(&["task_id", "subtask_count"], &["subtask_ids", "truncated"]),
        ),
        (TASK_COMPLETED, EventSchema::new(&["task_id"], &["result"])),
        (TASK_FAILED, EventSchema::new(&["task_id", "reason"], &[])),
        (
            TASK_WAITING_ON_HUMAN,
            EventSchema::new(&["task_id"], &["interaction_id"]),
        ),
        (TASK_PAUSED, EventSchema::new(&["task_id"], &[])),
        (TASK_RESUMED, EventSchema::new(&["task_id"], &["from"])),
        (
            SUBTASK_CREATED,
            EventSchema::new(
                &["task_id", "parent_id", "title"],
                &["agent", "complexity", "priority", "depends_on"],
            ),
        ),
        (
            SUBTASK_ASSIGNED,
            EventSchema::new(&["task_id", "parent_id", "agent"], &["activity_id"]),
        ),
        (
            SUBTASK_DEFERRED,
            EventSchema::new(&["task_id", "parent_id", "agent", "reason"], &[]),
        ),
        (
            SUBTASK_COMPLETED,
            EventSchema::new(&["task_id", "parent_id"], &["result"]),
        ),
        (
            SUBTASK_FAILED,
            EventSchema::new(&["task_id", "parent_id", "reason"], &[]),
        ),
        (
            RECOVERY_DECIDED,
            EventSchema::new(
                &["task_id", "parent_id", "action"],
                &["replacement_id", "reason"],
            ),
        ),
        (
            HUMAN_INTERACTION_REQUESTED,
            EventSchema::new(
                &["interaction_id", "task_id", "question"],
                &["required", "subtask_id", "interaction_type"],
            ),
        ),
        (
            HUMAN_INTERACTION_ANSWERED,
            EventSchema::new(&["interaction_id", "task_id"], &["response"]),
        ),
    ]
}

pub fn register_defaults(registry: &SchemaRegistry) {
    for (event_type, schema) in default_schemas() {
        registry.register_schema(event_type, schema);
    }
}

/// Event announcing `task` moving from `from` to `to`.
///
/// Subtasks use the `subtask.*` names. A subtask leaving `pending` is an
/// assignment. `None` when the transition is not announced on its own
/// (a retry requeue is covered by `recovery.decided`).
pub fn transition_event(task: &Task, from: TaskState, to: TaskState) -> Option<&'static str> {
    use TaskState::*;

    let subtask = !task.is_root();
    match (from, to) {
        (Pending, Active) if subtask => Some(SUBTASK_ASSIGNED),
        (Pending, Active) => Some(TASK_ACTIVATED),
        (WaitingOnHuman | Paused, Active) => Some(TASK_RESUMED),
        (_, WaitingOnHuman) => Some(TASK_WAITING_ON_HUMAN),
        (_, Paused) => Some(TASK_PAUSED),
        (_, Completed) if subtask => Some(SUBTASK_COMPLETED),
        (_, Completed) => Some(TASK_COMPLETED),
        (_, Failed) if subtask => Some(SUBTASK_FAILED),
        (_, Failed) => Some(TASK_FAILED),
        _ => None,
    }
}
