//! Leaf subtask execution.

use crate::core::{ActivityId, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::oracle::{prompts, Oracle};
use crate::orchestration::coordinator::record_usage;
use crate::orchestration::lifecycle::Lifecycle;
use crate::orchestration::pool::AgentPool;
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs leaf subtasks against the oracle.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    oracle: Arc<dyn Oracle>,
    lifecycle: Lifecycle,
    pool: Arc<AgentPool>,
}

impl Worker {
    pub fn new(oracle: Arc<dyn Oracle>, lifecycle: Lifecycle, pool: Arc<AgentPool>) -> Self {
        Self {
            store: lifecycle.store().clone(),
            oracle,
            lifecycle,
            pool,
        }
    }

    /// Execute the subtask `task_id` under `activity_id`.
    ///
    /// The outcome is reported through the task's state: completed with
    /// the oracle's text, or failed with the reason. The pool slot is
    /// released when the completion event is handled.
    pub async fn run(&self, task_id: TaskId, activity_id: ActivityId) -> Result<()> {
        let task = self.store.get_task(task_id).await?;
        if task.state != TaskState::Active {
            debug!(task = %task_id.short(), state = %task.state, "Skipping worker, task not active");
            self.abandon(activity_id).await;
            return Ok(());
        }

        let Some(kind) = task.metadata.assigned_agent.or(task.metadata.suggested_agent) else {
            return self.settle(task_id, activity_id, Err("no agent kind assigned".to_string())).await;
        };

        let mut inputs = Vec::with_capacity(task.depends_on_task_ids.len());
        for dep in &task.depends_on_task_ids {
            let dep = self.store.get_task(*dep).await?;
            inputs.push((dep.title, dep.result.unwrap_or_default()));
        }

        info!(task = %task_id.short(), agent = %kind, "Executing: {}", task.title);
        let outcome = match self
            .oracle
            .invoke(&prompts::execution(&task, kind, &inputs))
            .await
        {
            Ok(response) => {
                record_usage(self.store.as_ref(), Some(activity_id), &response).await;
                if response.text.trim().is_empty() {
                    Err("oracle returned no output".to_string())
                } else {
                    Ok(response.text)
                }
            }
            Err(e) => Err(e.to_string()),
        };
        self.settle(task_id, activity_id, outcome).await
    }

    async fn settle(
        &self,
        task_id: TaskId,
        activity_id: ActivityId,
        outcome: std::result::Result<String, String>,
    ) -> Result<()> {
        let reported = match outcome {
            Ok(text) => self.lifecycle.complete(task_id, Some(text)).await,
            Err(reason) => {
                warn!(task = %task_id.short(), %reason, "Worker failed");
                self.lifecycle.fail(task_id, &reason).await
            }
        };

        match reported {
            Ok(_) => Ok(()),
            Err(e) => {
                // No completion event will arrive to free the slot.
                self.abandon(activity_id).await;
                Err(e)
            }
        }
    }

    async fn abandon(&self, activity_id: ActivityId) {
        self.pool.release(activity_id);
        match self.store.get_activity(activity_id).await {
            Ok(mut activity) if activity.is_running() => {
                activity.finish(false);
                if let Err(e) = self.store.update_activity(activity).await {
                    warn!(activity = %activity_id.short(), error = %e, "Could not close activity");
                }
            }
            Ok(_) => {}
            Err(Error::ActivityNotFound(_)) => {}
            Err(e) => warn!(activity = %activity_id.short(), error = %e, "Could not load activity"),
        }
    }
}
