//! In-memory store.

use super::{MetadataEdit, Snapshot, Store};
use crate::core::{
    ActivityId, AgentActivity, HumanInteraction, InteractionId, Task, TaskId, TaskState,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order of tasks.
    task_order: Vec<TaskId>,
    events: Vec<Event>,
    event_index: HashMap<EventId, usize>,
    interactions: Vec<HumanInteraction>,
    activities: HashMap<ActivityId, AgentActivity>,
}

impl Inner {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))
    }

    fn ordered_tasks<P>(&self, predicate: P) -> Vec<Task>
    where
        P: Fn(&Task) -> bool,
    {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| predicate(t))
            .cloned()
            .collect()
    }
}

/// Store backed by in-process maps behind a single `RwLock`.
///
/// Every mutation takes the write lock, so compare-and-set is atomic with
/// respect to every other operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut inner = Inner::default();
        for task in snapshot.tasks {
            inner.task_order.push(task.id);
            inner.tasks.insert(task.id, task);
        }
        for event in snapshot.events {
            inner.event_index.insert(event.id, inner.events.len());
            inner.events.push(event);
        }
        inner.interactions = snapshot.interactions;
        for activity in snapshot.activities {
            inner.activities.insert(activity.id, activity);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Export everything in insertion order.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        let mut activities: Vec<AgentActivity> = inner.activities.values().cloned().collect();
        activities.sort_by_key(|a| a.started_at);
        Snapshot {
            tasks: inner.ordered_tasks(|_| true),
            events: inner.events.clone(),
            interactions: inner.interactions.clone(),
            activities,
        }
    }

    pub async fn task_count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&task.id) {
            inner.task_order.push(task.id);
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    async fn compare_and_set_state(
        &self,
        id: TaskId,
        expected: TaskState,
        target: TaskState,
    ) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        if task.state != expected {
            return Err(Error::StateConflict {
                task_id: id,
                expected,
                actual: task.state,
            });
        }
        task.apply_state(target);
        Ok(task.clone())
    }

    async fn set_dependencies(&self, id: TaskId, deps: Vec<TaskId>) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        task.set_dependencies(deps);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn update_metadata(&self, id: TaskId, edit: MetadataEdit) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        edit(&mut task.metadata);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn set_result(&self, id: TaskId, result: Option<String>) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        task.result = result;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn children_of(&self, parent: TaskId) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.ordered_tasks(|t| t.parent_id == Some(parent)))
    }

    async fn tasks_with_unmet_dependencies(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let lookup = |id: &TaskId| inner.tasks.get(id).map(|t| t.state);
        Ok(inner.ordered_tasks(|t| {
            t.state == TaskState::Pending && !t.dependencies_satisfied(lookup)
        }))
    }

    async fn root_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.ordered_tasks(Task::is_root))
    }

    async fn delete_task_cascade(&self, id: TaskId) -> Result<usize> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&id) {
            return Err(Error::TaskNotFound(id));
        }

        let mut doomed = vec![id];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor];
            doomed.extend(
                inner
                    .tasks
                    .values()
                    .filter(|t| t.parent_id == Some(current))
                    .map(|t| t.id),
            );
            cursor += 1;
        }

        for task_id in &doomed {
            inner.tasks.remove(task_id);
        }
        inner.task_order.retain(|t| !doomed.contains(t));
        Ok(doomed.len())
    }

    async fn insert_event(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.write().await;
        let position = inner.events.len();
        inner.event_index.insert(event.id, position);
        inner.events.push(event);
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Event> {
        let inner = self.inner.read().await;
        inner
            .event_index
            .get(&id)
            .and_then(|i| inner.events.get(*i))
            .cloned()
            .ok_or(Error::EventNotFound(id))
    }

    async fn mark_event_processed(&self, id: EventId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = *inner.event_index.get(&id).ok_or(Error::EventNotFound(id))?;
        if let Some(event) = inner.events.get_mut(index) {
            event.processed_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn events(&self) -> Result<Vec<Event>> {
        Ok(self.inner.read().await.events.clone())
    }

    async fn insert_interaction(&self, interaction: HumanInteraction) -> Result<()> {
        self.inner.write().await.interactions.push(interaction);
        Ok(())
    }

    async fn get_interaction(&self, id: InteractionId) -> Result<HumanInteraction> {
        self.inner
            .read()
            .await
            .interactions
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(Error::InteractionNotFound(id))
    }

    async fn update_interaction(&self, interaction: HumanInteraction) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .interactions
            .iter_mut()
            .find(|i| i.id == interaction.id)
            .ok_or(Error::InteractionNotFound(interaction.id))?;
        *slot = interaction;
        Ok(())
    }

    async fn pending_interactions(
        &self,
        task_id: Option<TaskId>,
    ) -> Result<Vec<HumanInteraction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .interactions
            .iter()
            .filter(|i| i.is_pending())
            .filter(|i| task_id.map(|t| i.task_id == t).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn insert_activity(&self, activity: AgentActivity) -> Result<()> {
        self.inner
            .write()
            .await
            .activities
            .insert(activity.id, activity);
        Ok(())
    }

    async fn get_activity(&self, id: ActivityId) -> Result<AgentActivity> {
        self.inner
            .read()
            .await
            .activities
            .get(&id)
            .cloned()
            .ok_or(Error::ActivityNotFound(id))
    }

    async fn update_activity(&self, activity: AgentActivity) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .activities
            .get_mut(&activity.id)
            .ok_or(Error::ActivityNotFound(activity.id))?;
        *slot = activity;
        Ok(())
    }
}
