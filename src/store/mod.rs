//! Durable record store interface.
//!
//! The orchestration core only talks to storage through [`Store`]. Task
//! state changes go through [`Store::compare_and_set_state`], which rejects
//! the write when the stored state no longer matches what the caller read.

mod memory;
mod snapshot;

pub use memory::MemoryStore;
pub use snapshot::Snapshot;

use crate::core::{
    ActivityId, AgentActivity, HumanInteraction, InteractionId, Task, TaskId, TaskMetadata,
    TaskState,
};
use crate::error::Result;
use crate::events::{Event, EventId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// In-place edit of a task's metadata.
pub type MetadataEdit = Box<dyn FnOnce(&mut TaskMetadata) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    // Tasks

    async fn insert_task(&self, task: Task) -> Result<()>;

    /// Fetch the freshest copy of a task.
    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Atomically move a task from `expected` to `target`.
    ///
    /// Fails with `StateConflict` when the stored state is not `expected`.
    /// Edge legality is the caller's concern.
    async fn compare_and_set_state(
        &self,
        id: TaskId,
        expected: TaskState,
        target: TaskState,
    ) -> Result<Task>;

    async fn set_dependencies(&self, id: TaskId, deps: Vec<TaskId>) -> Result<Task>;

    async fn update_metadata(&self, id: TaskId, edit: MetadataEdit) -> Result<Task>;

    async fn set_result(&self, id: TaskId, result: Option<String>) -> Result<Task>;

    /// Direct children of `parent`, in insertion order.
    async fn children_of(&self, parent: TaskId) -> Result<Vec<Task>>;

    /// Pending tasks with at least one dependency not yet completed.
    async fn tasks_with_unmet_dependencies(&self) -> Result<Vec<Task>>;

    /// Tasks without a parent, in insertion order.
    async fn root_tasks(&self) -> Result<Vec<Task>>;

    /// Delete a task and all its descendants. Returns how many were removed.
    async fn delete_task_cascade(&self, id: TaskId) -> Result<usize>;

    // Events (append-only)

    async fn insert_event(&self, event: Event) -> Result<()>;

    async fn get_event(&self, id: EventId) -> Result<Event>;

    /// Set `processed_at` if it is not already set.
    async fn mark_event_processed(&self, id: EventId, at: DateTime<Utc>) -> Result<()>;

    /// All events, in publish order.
    async fn events(&self) -> Result<Vec<Event>>;

    // Human interactions

    async fn insert_interaction(&self, interaction: HumanInteraction) -> Result<()>;

    async fn get_interaction(&self, id: InteractionId) -> Result<HumanInteraction>;

    async fn update_interaction(&self, interaction: HumanInteraction) -> Result<()>;

    /// Pending interactions, optionally restricted to one task.
    async fn pending_interactions(&self, task_id: Option<TaskId>)
        -> Result<Vec<HumanInteraction>>;

    // Agent activities

    async fn insert_activity(&self, activity: AgentActivity) -> Result<()>;

    async fn get_activity(&self, id: ActivityId) -> Result<AgentActivity>;

    async fn update_activity(&self, activity: AgentActivity) -> Result<()>;
}
