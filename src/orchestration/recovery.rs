//! Failure recovery for subtasks.
//!
//! When a child fails, the oracle is shown the failure and asked for one
//! `ACTION: <TOKEN>` decision. Anything it does not answer clearly becomes
//! a HUMAN escalation. Each failure is classified exactly once: the chosen
//! action is claimed in the failed task's metadata before it is applied.

use crate::core::{AgentKind, Complexity, DependencyGraph, RecoveryAction, Task, TaskId, TaskState};
use crate::error::Result;
use crate::events::catalog;
use crate::oracle::{prompts, Oracle};
use crate::orchestration::coordinator::record_usage;
use crate::orchestration::human::HumanDesk;
use crate::orchestration::lifecycle::Lifecycle;
use regex::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

/// RETRY decisions past this many attempts become HUMAN.
pub const MAX_RETRIES: u32 = 2;

static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ACTION:\s*\**\s*([A-Z]+)").unwrap());

/// First recognized `ACTION:` token in `text`, if any.
pub fn parse_action(text: &str) -> Option<RecoveryAction> {
    ACTION_RE
        .captures_iter(text)
        .find_map(|caps| RecoveryAction::parse(&caps[1]))
}

/// Classify failure-analysis text. No recognized token means HUMAN.
pub fn classify(text: &str) -> RecoveryAction {
    parse_action(text).unwrap_or(RecoveryAction::Human)
}

/// Decides and applies what happens to a failed subtask.
///
/// Each failure is decided exactly once. Whatever cannot be applied ends up
/// as a required question to a human on the parent.
#[derive(Clone)]
pub struct Recovery {
    oracle: Arc<dyn Oracle>,
    lifecycle: Lifecycle,
    human: HumanDesk,
}

impl Recovery {
    pub fn new(oracle: Arc<dyn Oracle>, lifecycle: Lifecycle, human: HumanDesk) -> Self {
        Self {
            oracle,
            lifecycle,
            human,
        }
    }

    /// Choose and apply a policy for the failed child `failed_id`.
    pub async fn handle_failure(
        &self,
        parent_id: TaskId,
        failed_id: TaskId,
    ) -> Result<RecoveryAction> {
        let store = self.lifecycle.store();
        let parent = store.get_task(parent_id).await?;
        let failed = store.get_task(failed_id).await?;
        if let Some(action) = failed.metadata.recovery {
            return Ok(action);
        }

        let (mut action, analysis) = match self
            .oracle
            .invoke(&prompts::failure_analysis(&parent, &failed))
            .await
        {
            Ok(response) => {
                record_usage(store.as_ref(), parent.metadata.activity_id, &response).await;
                (classify(&response.text), Some(response.text))
            }
            Err(e) => {
                warn!(task = %failed_id.short(), error = %e, "Failure analysis unavailable, escalating");
                (RecoveryAction::Human, None)
            }
        };

        if action == RecoveryAction::Retry && failed.metadata.retry_count >= MAX_RETRIES {
            info!(task = %failed_id.short(), retries = failed.metadata.retry_count, "Retry budget spent, escalating");
            action = RecoveryAction::Human;
        }

        self.apply(&parent, &failed, action, analysis.as_deref(), None)
            .await
    }

    /// Apply a human's answer about a failed subtask.
    ///
    /// An explicit `ACTION:` token is applied as given; anything else is
    /// guidance for a redefined subtask.
    pub async fn apply_human_decision(
        &self,
        parent_id: TaskId,
        failed_id: TaskId,
        response: &str,
    ) -> Result<RecoveryAction> {
        let store = self.lifecycle.store();
        let parent = store.get_task(parent_id).await?;
        let failed = store.get_task(failed_id).await?;

        let action = match parse_action(response) {
            Some(RecoveryAction::Human) | None => RecoveryAction::Redefine,
            Some(action) => action,
        };
        self.apply(
            &parent,
            &failed,
            action,
            Some(response),
            Some(RecoveryAction::Human),
        )
        .await
    }

    /// Claim the failure for `action`, then carry it out.
    ///
    /// `reclaim` lets a decision replace an earlier one (a human answering
    /// a HUMAN escalation). Returns the action that ended up in effect: an
    /// action that cannot be carried out falls back to HUMAN, and if even
    /// that fails the claim is rolled back so the failure is seen again.
    async fn apply(
        &self,
        parent: &Task,
        failed: &Task,
        action: RecoveryAction,
        guidance: Option<&str>,
        reclaim: Option<RecoveryAction>,
    ) -> Result<RecoveryAction> {
        let store = self.lifecycle.store();
        let claimed = Arc::new(AtomicBool::new(false));
        let flag = claimed.clone();
        store
            .update_metadata(
                failed.id,
                Box::new(move |m| {
                    if m.recovery.is_none() || (reclaim.is_some() && m.recovery == reclaim) {
                        m.recovery = Some(action);
                        flag.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await?;
        if !claimed.load(Ordering::SeqCst) {
            debug!(task = %failed.id.short(), "Failure already handled");
            return Ok(failed.metadata.recovery.unwrap_or(action));
        }

        info!(task = %failed.id.short(), parent = %parent.id.short(), %action, "Recovery decided");
        let reason = failed
            .metadata
            .failure_reason
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());

        let (action, replacement) = match self
            .carry_out(parent, failed, action, &reason, guidance)
            .await
        {
            Ok(replacement) => (action, replacement),
            Err(e) if action != RecoveryAction::Human => {
                warn!(task = %failed.id.short(), %action, error = %e, "Recovery action failed, escalating");
                let fallback = format!("{} could not be applied ({})", action, e);
                if let Err(escalation) = self
                    .claim_and_escalate(parent, failed, action, &fallback)
                    .await
                {
                    self.release_claim(failed.id, reclaim).await;
                    return Err(escalation);
                }
                (RecoveryAction::Human, None)
            }
            Err(e) => {
                self.release_claim(failed.id, reclaim).await;
                return Err(e);
            }
        };

        self.lifecycle
            .notify(
                parent,
                catalog::RECOVERY_DECIDED,
                json!({
                    "task_id": failed.id.to_string(),
                    "parent_id": parent.id.to_string(),
                    "action": action.as_str(),
                    "replacement_id": replacement.map(|id| id.to_string()),
                }),
            )
            .await;
        Ok(action)
    }

    /// Run one claimed action. Returns the replacement for REDEFINE/SPLIT.
    async fn carry_out(
        &self,
        parent: &Task,
        failed: &Task,
        action: RecoveryAction,
        reason: &str,
        guidance: Option<&str>,
    ) -> Result<Option<TaskId>> {
        match action {
            RecoveryAction::Retry => {
                self.lifecycle
                    .recover(failed.id, TaskState::Pending, None)
                    .await?;
                self.lifecycle
                    .store()
                    .update_metadata(
                        failed.id,
                        Box::new(|m| {
                            m.retry_count += 1;
                            m.recovery = None;
                            m.failure_reason = None;
                        }),
                    )
                    .await?;
                Ok(None)
            }
            RecoveryAction::Redefine | RecoveryAction::Split => self
                .replace(parent, failed, action, reason, guidance)
                .await
                .map(Some),
            RecoveryAction::Human => {
                self.escalate(parent, failed, reason).await?;
                Ok(None)
            }
            RecoveryAction::Skip => {
                let result = format!("Skipped as non-critical: {}", reason);
                self.lifecycle
                    .recover(failed.id, TaskState::Completed, Some(result))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn escalate(&self, parent: &Task, failed: &Task, reason: &str) -> Result<()> {
        let question = format!(
            "Subtask \"{}\" failed: {}. Reply with ACTION: RETRY, REDEFINE, SPLIT or SKIP, \
             or describe how the subtask should be redefined.",
            failed.title, reason
        );
        self.human
            .escalate(parent.id, &question, true, Some(failed.id))
            .await?;
        Ok(())
    }

    /// Swap a claimed `from` for HUMAN and raise the request.
    async fn claim_and_escalate(
        &self,
        parent: &Task,
        failed: &Task,
        from: RecoveryAction,
        reason: &str,
    ) -> Result<()> {
        self.lifecycle
            .store()
            .update_metadata(
                failed.id,
                Box::new(move |m| {
                    if m.recovery == Some(from) {
                        m.recovery = Some(RecoveryAction::Human);
                    }
                }),
            )
            .await?;
        self.escalate(parent, failed, reason).await
    }

    /// Put the claim back to what it was before [`Recovery::apply`] took it.
    async fn release_claim(&self, failed_id: TaskId, previous: Option<RecoveryAction>) {
        let released = self
            .lifecycle
            .store()
            .update_metadata(failed_id, Box::new(move |m| m.recovery = previous))
            .await;
        if let Err(e) = released {
            warn!(task = %failed_id.short(), error = %e, "Could not release recovery claim");
        }
    }

    /// Retire `failed` in favour of a new sibling (REDEFINE or SPLIT).
    async fn replace(
        &self,
        parent: &Task,
        failed: &Task,
        action: RecoveryAction,
        reason: &str,
        guidance: Option<&str>,
    ) -> Result<TaskId> {
        let store = self.lifecycle.store();

        let mut description = format!(
            "{}\n\nA previous attempt failed: {}",
            failed.description, reason
        );
        if let Some(guidance) = guidance.map(str::trim).filter(|g| !g.is_empty()) {
            description.push_str(&format!("\n\nGuidance: {}", guidance));
        }

        let mut replacement = Task::child_of(parent, &failed.title, &description)
            .with_priority(failed.priority)
            .with_dependencies(failed.depends_on_task_ids.clone());
        if action == RecoveryAction::Split {
            replacement = replacement
                .with_agent(AgentKind::Coordinator)
                .with_complexity(Complexity::Complex);
        } else {
            replacement.metadata.suggested_agent = failed.metadata.suggested_agent;
            replacement.metadata.complexity = failed.metadata.complexity;
        }

        // Rewire dependents in memory first so the graph can be checked
        // before anything is written.
        let mut siblings = store.children_of(parent.id).await?;
        let mut rewired = Vec::new();
        for sibling in siblings.iter_mut() {
            if sibling.depends_on_task_ids.contains(&failed.id) {
                let deps = sibling
                    .depends_on_task_ids
                    .iter()
                    .map(|d| if *d == failed.id { replacement.id } else { *d })
                    .collect();
                sibling.set_dependencies(deps);
                rewired.push((sibling.id, sibling.depends_on_task_ids.clone()));
            }
        }
        siblings.push(replacement.clone());
        DependencyGraph::from_tasks(&siblings)?;

        store.insert_task(replacement.clone()).await?;
        let replacement_id = replacement.id;
        store
            .update_metadata(
                failed.id,
                Box::new(move |m| m.superseded_by = Some(replacement_id)),
            )
            .await?;
        for (sibling_id, deps) in rewired {
            store.set_dependencies(sibling_id, deps).await?;
        }

        self.lifecycle
            .notify(
                &replacement,
                catalog::SUBTASK_CREATED,
                json!({
                    "task_id": replacement.id.to_string(),
                    "parent_id": parent.id.to_string(),
                    "title": replacement.title,
                    "agent": replacement.metadata.suggested_agent.map(|k| k.as_str()),
                    "replaces": failed.id.to_string(),
                }),
            )
            .await;
        Ok(replacement.id)
    }
}
