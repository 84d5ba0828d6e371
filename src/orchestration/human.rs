//! Human escalation desk.
//!
//! Anything the system cannot resolve on its own ends up here as a
//! [`HumanInteraction`]. A required request blocks only its owning task,
//! which sits in `waiting_on_human` until the request is answered or
//! expires.

use crate::config::HumanConfig;
use crate::core::{
    HumanInteraction, InteractionId, InteractionStatus, InteractionType, TaskId, TaskState,
};
use crate::error::{Error, Result};
use crate::events::catalog;
use crate::orchestration::lifecycle::Lifecycle;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

/// Raises, answers and expires human interactions.
#[derive(Clone)]
pub struct HumanDesk {
    lifecycle: Lifecycle,
    timeout: Option<Duration>,
}

impl HumanDesk {
    pub fn new(lifecycle: Lifecycle, config: &HumanConfig) -> Self {
        let timeout = config
            .timeout_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(Duration::seconds);
        Self { lifecycle, timeout }
    }

    /// Raise a request about `task_id`.
    ///
    /// A required request moves an `active` task to `waiting_on_human`.
    /// `subtask_id` names the subtask the question is about, if any.
    pub async fn escalate(
        &self,
        task_id: TaskId,
        question: &str,
        required: bool,
        subtask_id: Option<TaskId>,
    ) -> Result<HumanInteraction> {
        let store = self.lifecycle.store();
        let task = store.get_task(task_id).await?;

        let kind = if required {
            InteractionType::InputRequest
        } else {
            InteractionType::Intervention
        };
        let mut interaction = HumanInteraction::new(kind, task_id, question, required);
        if let Some(subtask_id) = subtask_id {
            interaction = interaction.about_subtask(subtask_id);
        }
        if let Some(timeout) = self.timeout {
            let expires = interaction.created_at + timeout;
            interaction = interaction.expiring_at(expires);
        }
        store.insert_interaction(interaction.clone()).await?;

        info!(
            interaction = %interaction.id.short(),
            task = %task_id.short(),
            required,
            "Human input requested: {}",
            question
        );
        self.lifecycle
            .notify(
                &task,
                catalog::HUMAN_INTERACTION_REQUESTED,
                json!({
                    "interaction_id": interaction.id.to_string(),
                    "task_id": task_id.to_string(),
                    "question": question,
                    "required": required,
                    "subtask_id": subtask_id.map(|id| id.to_string()),
                }),
            )
            .await;

        if required && task.state == TaskState::Active {
            self.lifecycle.wait_on_human(task_id).await?;
        }
        Ok(interaction)
    }

    /// Record a response. The owning task resumes once nothing else blocks it.
    pub async fn answer(&self, id: InteractionId, response: &str) -> Result<HumanInteraction> {
        let store = self.lifecycle.store();
        let mut interaction = store.get_interaction(id).await?;
        if !interaction.is_pending() {
            return Err(Error::InteractionNotPending(id));
        }

        interaction.status = InteractionStatus::Answered;
        interaction.response = Some(response.to_string());
        interaction.resolved_at = Some(Utc::now());
        store.update_interaction(interaction.clone()).await?;

        let task = store.get_task(interaction.task_id).await?;
        let still_blocked = store
            .pending_interactions(Some(task.id))
            .await?
            .iter()
            .any(|i| i.is_blocking());
        let task = if task.state == TaskState::WaitingOnHuman && !still_blocked {
            self.lifecycle.resume(task.id).await?
        } else {
            task
        };

        self.lifecycle
            .notify(
                &task,
                catalog::HUMAN_INTERACTION_ANSWERED,
                json!({
                    "interaction_id": id.to_string(),
                    "task_id": task.id.to_string(),
                    "response": response,
                }),
            )
            .await;
        Ok(interaction)
    }

    /// Dismiss an advisory request. Required requests must be answered.
    pub async fn ignore(&self, id: InteractionId) -> Result<HumanInteraction> {
        let store = self.lifecycle.store();
        let mut interaction = store.get_interaction(id).await?;
        if !interaction.is_pending() {
            return Err(Error::InteractionNotPending(id));
        }
        if interaction.required {
            return Err(Error::InteractionRequired(id));
        }
        interaction.status = InteractionStatus::Ignored;
        interaction.resolved_at = Some(Utc::now());
        store.update_interaction(interaction.clone()).await?;
        Ok(interaction)
    }

    /// Close every pending request past its `expires_at`.
    ///
    /// The owning task of an expired required request fails.
    pub async fn expire_interactions(&self, now: DateTime<Utc>) -> Result<Vec<InteractionId>> {
        let store = self.lifecycle.store();
        let mut expired = Vec::new();

        for mut interaction in store.pending_interactions(None).await? {
            if !interaction.is_expired(now) {
                continue;
            }
            interaction.status = InteractionStatus::Ignored;
            interaction.resolved_at = Some(now);
            store.update_interaction(interaction.clone()).await?;
            expired.push(interaction.id);

            if interaction.required {
                warn!(
                    interaction = %interaction.id.short(),
                    task = %interaction.task_id.short(),
                    "Required human input expired"
                );
                if let Err(e) = self
                    .lifecycle
                    .fail(interaction.task_id, "human input timed out")
                    .await
                {
                    warn!(task = %interaction.task_id.short(), error = %e, "Could not fail task after expiry");
                }
            }
        }
        Ok(expired)
    }
}
