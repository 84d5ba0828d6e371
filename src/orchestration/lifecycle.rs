//! Guarded task state transitions.
//!
//! Every transition re-reads the task, checks the state machine edge and
//! the graph guards against that fresh copy, writes through the store's
//! compare-and-set, and announces the change on the event bus. A publish
//! failure is logged; the transition itself has already happened.

use crate::core::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::events::catalog;
use crate::events::{EventBus, EventMetadata, PublishOutcome};
use crate::store::Store;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Post-transition writes carried along with a state change.
#[derive(Debug, Default)]
struct Outcome {
    result: Option<String>,
    failure_reason: Option<String>,
}

/// The only path by which a task's state changes.
///
/// Every transition is checked, guarded, applied as a compare-and-set and
/// then announced on the bus.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Move a task to `target`, merging `extra` into the announced payload.
    pub async fn transition(&self, id: TaskId, target: TaskState, extra: Value) -> Result<Task> {
        self.apply(id, target, extra, Outcome::default()).await
    }

    pub async fn activate(&self, id: TaskId, extra: Value) -> Result<Task> {
        self.transition(id, TaskState::Active, extra).await
    }

    /// Block on a required human request. Refused unless one is pending.
    pub async fn wait_on_human(&self, id: TaskId) -> Result<Task> {
        self.transition(id, TaskState::WaitingOnHuman, json!({})).await
    }

    /// `waiting_on_human -> active` once nothing blocks the task.
    pub async fn resume(&self, id: TaskId) -> Result<Task> {
        self.transition(id, TaskState::Active, json!({})).await
    }

    pub async fn pause(&self, id: TaskId) -> Result<Task> {
        self.transition(id, TaskState::Paused, json!({})).await
    }

    pub async fn unpause(&self, id: TaskId) -> Result<Task> {
        self.transition(id, TaskState::Active, json!({})).await
    }

    /// Complete a task, storing its final artifact.
    pub async fn complete(&self, id: TaskId, result: Option<String>) -> Result<Task> {
        let extra = json!({ "result": result });
        let outcome = Outcome {
            result,
            ..Outcome::default()
        };
        self.apply(id, TaskState::Completed, extra, outcome).await
    }

    /// Fail a task, recording `reason` on it.
    pub async fn fail(&self, id: TaskId, reason: &str) -> Result<Task> {
        let outcome = Outcome {
            failure_reason: Some(reason.to_string()),
            ..Outcome::default()
        };
        self.apply(id, TaskState::Failed, json!({ "reason": reason }), outcome)
            .await
    }

    /// Take one of the recovery-only edges out of `failed`.
    pub async fn recover(
        &self,
        id: TaskId,
        target: TaskState,
        result: Option<String>,
    ) -> Result<Task> {
        let task = self.store.get_task(id).await?;
        if !task.state.can_recover_to(target) {
            return Err(Error::InvalidStateTransition {
                task_id: id,
                from: task.state,
                to: target,
                reason: "not a recovery edge".to_string(),
            });
        }

        let mut updated = self
            .store
            .compare_and_set_state(id, task.state, target)
            .await?;
        if result.is_some() {
            updated = self.store.set_result(id, result.clone()).await?;
        }
        debug!(task = %id.short(), to = %target, "recovered");
        self.announce(&updated, task.state, target, json!({ "result": result }))
            .await;
        Ok(updated)
    }

    async fn apply(
        &self,
        id: TaskId,
        target: TaskState,
        extra: Value,
        outcome: Outcome,
    ) -> Result<Task> {
        let task = self.store.get_task(id).await?;
        task.check_transition(target)?;
        self.check_guards(&task, target).await?;

        let mut updated = self
            .store
            .compare_and_set_state(id, task.state, target)
            .await?;
        if outcome.result.is_some() {
            updated = self.store.set_result(id, outcome.result).await?;
        }
        if let Some(reason) = outcome.failure_reason {
            updated = self
                .store
                .update_metadata(id, Box::new(move |m| m.failure_reason = Some(reason)))
                .await?;
        }

        debug!(task = %id.short(), from = %task.state, to = %target, "transition");
        self.announce(&updated, task.state, target, extra).await;
        Ok(updated)
    }

    async fn check_guards(&self, task: &Task, target: TaskState) -> Result<()> {
        let refuse = |reason: String| Error::InvalidStateTransition {
            task_id: task.id,
            from: task.state,
            to: target,
            reason,
        };

        match (task.state, target) {
            (_, TaskState::Completed) => {
                let unfinished = self
                    .store
                    .children_of(task.id)
                    .await?
                    .into_iter()
                    .filter(|c| !c.is_retired() && c.state != TaskState::Completed)
                    .count();
                if unfinished > 0 {
                    return Err(refuse(format!("{} child tasks are not completed", unfinished)));
                }
            }
            (_, TaskState::WaitingOnHuman) => {
                if !self.has_blocking_request(task.id).await? {
                    return Err(refuse("no required human input request is pending".to_string()));
                }
            }
            (TaskState::WaitingOnHuman, TaskState::Active) => {
                if self.has_blocking_request(task.id).await? {
                    return Err(refuse("a required human input request is still pending".to_string()));
                }
            }
            (TaskState::Pending, TaskState::Active) if !task.is_root() => {
                let mut states = HashMap::new();
                for dep in &task.depends_on_task_ids {
                    if let Ok(t) = self.store.get_task(*dep).await {
                        states.insert(t.id, t.state);
                    }
                }
                let unmet = task.unmet_dependencies(|id| states.get(id).copied());
                if !unmet.is_empty() {
                    return Err(Error::DependencyUnsatisfied {
                        task_id: task.id,
                        unmet,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn has_blocking_request(&self, id: TaskId) -> Result<bool> {
        Ok(self
            .store
            .pending_interactions(Some(id))
            .await?
            .iter()
            .any(|i| i.is_blocking()))
    }

    async fn announce(&self, task: &Task, from: TaskState, to: TaskState, extra: Value) {
        let Some(event_type) = catalog::transition_event(task, from, to) else {
            return;
        };
        let mut data = json!({
            "task_id": task.id.to_string(),
            "parent_id": task.parent_id.map(|p| p.to_string()),
            "title": task.title,
            "from": from.as_str(),
            "to": to.as_str(),
        });
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            for (key, value) in extra {
                data.insert(key, value);
            }
        }
        self.notify(task, event_type, data).await;
    }

    /// Publish an event about `task`, logging instead of failing.
    pub async fn notify(&self, task: &Task, event_type: &str, data: Value) -> Option<PublishOutcome> {
        let metadata = self.metadata_for(task).await;
        match self.bus.publish(event_type, data, metadata).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(event_type, task = %task.id.short(), error = %e, "Could not publish event");
                None
            }
        }
    }

    /// Event metadata for `task`: its activity's correlation and its root task.
    pub async fn metadata_for(&self, task: &Task) -> EventMetadata {
        let mut metadata = EventMetadata::for_task(task).in_project(self.root_of(task).await);
        if let Some(activity_id) = task.metadata.activity_id {
            if let Ok(activity) = self.store.get_activity(activity_id).await {
                metadata = metadata.with_correlation(activity.correlation_id);
            }
        }
        metadata
    }

    /// The root task above `task` (itself when it is a root).
    pub async fn root_of(&self, task: &Task) -> TaskId {
        let mut root = task.id;
        let mut next = task.parent_id;
        while let Some(parent_id) = next {
            match self.store.get_task(parent_id).await {
                Ok(parent) => {
                    root = parent.id;
                    next = parent.parent_id;
                }
                Err(_) => break,
            }
        }
        root
    }
}
