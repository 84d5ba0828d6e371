//! Coordinator: decomposition, materialization and the progress loop.
//!
//! A coordinator owns one task. It asks the oracle to break the task
//! down, materializes the parsed records as child tasks, and then keeps
//! re-entering [`Coordinator::evaluate_progress`] as children finish:
//! finalize when every live child is completed, route failures to
//! recovery, otherwise assign more eligible work.
//!
//! Sub-coordinators are not a separate type. A `CoordinatorAgent` subtask
//! is assigned like any other and then run through [`Coordinator::run`]
//! one nesting level deeper.

use crate::config::Limits;
use crate::core::{
    ActivityId, AgentActivity, AgentKind, InteractionId, Task, TaskId, TaskRole, TaskState,
    DependencyGraph,
};
use crate::error::{Error, Result};
use crate::events::catalog;
use crate::oracle::{prompts, Oracle, OracleResponse};
use crate::orchestration::dispatch::{WorkDispatcher, WorkUnit};
use crate::orchestration::human::HumanDesk;
use crate::orchestration::lifecycle::Lifecycle;
use crate::orchestration::parser::{parse_decomposition, SubtaskRecord};
use crate::orchestration::pool::AgentPool;
use crate::orchestration::recovery::Recovery;
use crate::orchestration::scheduler::{
    sort_by_priority_and_complexity, Scheduler, ASSIGNMENT_BATCH_CAP,
};
use crate::store::Store;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one coordination step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationOutcome {
    /// The task was decomposed and a first scheduling cycle ran.
    Decomposed { subtasks: usize, assigned: usize },
    /// A scheduling cycle ran.
    Scheduled { assigned: usize, deferred: usize },
    /// Failed children were routed to recovery.
    Recovering { failures: usize },
    /// Every live child completed and the task was finalized.
    Completed,
    /// The task now waits on a human.
    Escalated(InteractionId),
    /// The task is not `active`; nothing was done.
    Blocked(TaskState),
    /// The task has no children yet.
    Idle,
}

/// Result of trying to assign one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Assigned(ActivityId),
    /// Quota exhausted; the subtask stays `pending`.
    Deferred,
    Escalated(InteractionId),
}

/// How far [`Coordinator::run`] got before scheduling.
enum Prepared {
    Done(CoordinationOutcome),
    Decomposed(usize),
}

/// Subtask ids touched by one scheduling cycle, by what happened to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub assigned: Vec<TaskId>,
    pub deferred: Vec<TaskId>,
    pub escalated: Vec<TaskId>,
}

/// Add an oracle response's token counts to an activity.
pub(crate) async fn record_usage(
    store: &dyn Store,
    activity_id: Option<ActivityId>,
    response: &OracleResponse,
) {
    let Some(activity_id) = activity_id else {
        return;
    };
    match store.get_activity(activity_id).await {
        Ok(mut activity) => {
            activity.record_usage(response.input_tokens, response.output_tokens);
            if let Err(e) = store.update_activity(activity).await {
                warn!(activity = %activity_id.short(), error = %e, "Could not record usage");
            }
        }
        Err(e) => debug!(activity = %activity_id.short(), error = %e, "No activity for usage"),
    }
}

/// Drives a non-leaf task: decomposition, assignment, progress and synthesis.
///
/// Cheap to clone; every clone shares the same store, pool and dispatcher.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    oracle: Arc<dyn Oracle>,
    lifecycle: Lifecycle,
    scheduler: Scheduler,
    pool: Arc<AgentPool>,
    dispatcher: Arc<dyn WorkDispatcher>,
    human: HumanDesk,
    recovery: Recovery,
    limits: Limits,
}

impl Coordinator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        lifecycle: Lifecycle,
        pool: Arc<AgentPool>,
        dispatcher: Arc<dyn WorkDispatcher>,
        human: HumanDesk,
        limits: Limits,
    ) -> Self {
        let store = lifecycle.store().clone();
        let recovery = Recovery::new(oracle.clone(), lifecycle.clone(), human.clone());
        Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            oracle,
            lifecycle,
            pool,
            dispatcher,
            human,
            recovery,
            limits,
        }
    }

    /// Failure handling for this coordinator's children.
    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Entry point for a `RunCoordinator` unit.
    ///
    /// The pool slot taken for `activity_id` covers decomposition only. It
    /// is handed back before the new children are scheduled, so a nested
    /// coordinator never waits on a slot held by its own ancestor.
    pub async fn run(&self, task_id: TaskId, activity_id: ActivityId) -> Result<CoordinationOutcome> {
        let prepared = self.prepare(task_id, activity_id).await;
        let released = self.release_slot(activity_id).await;
        let prepared = prepared?;
        released?;

        match prepared {
            Prepared::Done(outcome) => Ok(outcome),
            Prepared::Decomposed(subtasks) => {
                let report = self.run_scheduling_cycle(task_id).await?;
                Ok(CoordinationOutcome::Decomposed {
                    subtasks,
                    assigned: report.assigned.len(),
                })
            }
        }
    }

    async fn prepare(&self, task_id: TaskId, activity_id: ActivityId) -> Result<Prepared> {
        let mut task = self.store.get_task(task_id).await?;
        if task.state == TaskState::Pending {
            task = self
                .lifecycle
                .activate(task_id, json!({ "activity_id": activity_id.to_string() }))
                .await?;
        }
        if task.state != TaskState::Active {
            return Ok(Prepared::Done(CoordinationOutcome::Blocked(task.state)));
        }

        if !self.store.children_of(task_id).await?.is_empty() {
            debug!(task = %task_id.short(), "Already decomposed, re-evaluating");
            return self.evaluate_progress(task_id).await.map(Prepared::Done);
        }

        let level = task.metadata.nesting_level;
        if level > self.limits.max_nesting_depth {
            let err = Error::NestingLimit {
                task_id,
                level,
                max: self.limits.max_nesting_depth,
            };
            return self
                .escalate(task_id, &format!("Cannot decompose: {}", err), None)
                .await
                .map(Prepared::Done);
        }

        info!(task = %task_id.short(), level, "Decomposing: {}", task.title);
        let records = match self.decompose(&task, activity_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(task = %task_id.short(), error = %e, "Decomposition failed");
                return self
                    .escalate(task_id, &format!("Decomposition failed: {}", e), None)
                    .await
                    .map(Prepared::Done);
            }
        };

        let created = match self.materialize(&task, records).await {
            Ok(created) => created,
            Err(e @ Error::SubtaskBudgetExhausted { .. }) => {
                return self
                    .escalate(task_id, &e.to_string(), None)
                    .await
                    .map(Prepared::Done);
            }
            Err(e) => return Err(e),
        };

        self.lifecycle
            .notify(
                &task,
                catalog::TASK_DECOMPOSED,
                json!({
                    "task_id": task_id.to_string(),
                    "subtask_count": created.len(),
                }),
            )
            .await;
        Ok(Prepared::Decomposed(created.len()))
    }

    /// Hand back the slot held by `activity_id` and wake coordinators that
    /// deferred work waiting for it.
    async fn release_slot(&self, activity_id: ActivityId) -> Result<()> {
        let Some(released) = self.pool.release(activity_id) else {
            return Ok(());
        };
        for coordinator in released.waiting {
            debug!(task = %coordinator.short(), agent = %released.kind, "Slot freed, waking coordinator");
            self.dispatcher
                .submit(WorkUnit::CoordinationCycle {
                    task_id: coordinator,
                })
                .await?;
        }
        Ok(())
    }

    /// Ask the oracle for a breakdown of `task` and parse it.
    ///
    /// Token usage is charged to `activity_id` even when parsing fails. The
    /// records come back unvalidated; [`Coordinator::materialize`] applies
    /// the size limits and resolves dependency indices.
    ///
    /// # Errors
    /// Returns the oracle's error, or [`Error::DecompositionParse`] when no
    /// strategy finds a subtask in the reply.
    pub async fn decompose(&self, task: &Task, activity_id: ActivityId) -> Result<Vec<SubtaskRecord>> {
        let request = prompts::decomposition(task, self.limits.max_subtasks_per_decomposition);
        let response = self.oracle.invoke(&request).await?;
        record_usage(self.store.as_ref(), Some(activity_id), &response).await;
        parse_decomposition(&response.text)
    }

    /// Create child tasks for `records`, then wire their dependencies.
    ///
    /// All rows are inserted before any dependency is set, so an edge can
    /// never reference a task that does not exist yet.
    pub async fn materialize(&self, parent: &Task, mut records: Vec<SubtaskRecord>) -> Result<Vec<Task>> {
        let root_id = self.lifecycle.root_of(parent).await;
        let existing = self.count_descendants(root_id).await?;
        let remaining = self.limits.max_subtasks_per_root.saturating_sub(existing);
        if remaining == 0 {
            return Err(Error::SubtaskBudgetExhausted {
                root_id,
                max: self.limits.max_subtasks_per_root,
            });
        }

        let cap = self.limits.max_subtasks_per_decomposition.min(remaining);
        if records.len() > cap {
            warn!(
                task = %parent.id.short(),
                parsed = records.len(),
                kept = cap,
                "Truncating decomposition"
            );
            records.truncate(cap);
        }

        let rows: Vec<Task> = records
            .iter()
            .map(|r| {
                let mut task = Task::child_of(parent, &r.title, &r.description)
                    .with_priority(r.priority)
                    .with_complexity(r.complexity);
                task.metadata.suggested_agent = r.agent;
                task
            })
            .collect();
        let ids: Vec<TaskId> = rows.iter().map(|t| t.id).collect();

        let wired: Vec<Task> = rows
            .iter()
            .zip(&records)
            .map(|(row, record)| {
                let deps = record
                    .dependencies
                    .iter()
                    .filter_map(|index| index.checked_sub(1).and_then(|i| ids.get(i)))
                    .copied()
                    .collect();
                row.clone().with_dependencies(deps)
            })
            .collect();
        DependencyGraph::from_tasks(&wired)?;

        for row in rows {
            self.store.insert_task(row).await?;
        }

        let mut created = Vec::with_capacity(wired.len());
        for task in wired {
            let task = if task.depends_on_task_ids.is_empty() {
                task
            } else {
                self.store
                    .set_dependencies(task.id, task.depends_on_task_ids.clone())
                    .await?
            };
            self.lifecycle
                .notify(
                    &task,
                    catalog::SUBTASK_CREATED,
                    json!({
                        "task_id": task.id.to_string(),
                        "parent_id": parent.id.to_string(),
                        "title": task.title,
                        "agent": task.metadata.suggested_agent.map(|k| k.as_str()),
                        "priority": task.priority.as_str(),
                        "complexity": task.complexity().as_str(),
                        "depends_on": task
                            .depends_on_task_ids
                            .iter()
                            .map(|d| d.to_string())
                            .collect::<Vec<_>>(),
                    }),
                )
                .await;
            created.push(task);
        }
        info!(task = %parent.id.short(), subtasks = created.len(), "Materialized subtasks");
        Ok(created)
    }

    async fn count_descendants(&self, root_id: TaskId) -> Result<usize> {
        let mut count = 0;
        let mut frontier = vec![root_id];
        while let Some(id) = frontier.pop() {
            let children = self.store.children_of(id).await?;
            count += children.len();
            frontier.extend(children.iter().map(|c| c.id));
        }
        Ok(count)
    }

    /// Assign up to [`ASSIGNMENT_BATCH_CAP`] eligible subtasks of `task_id`.
    ///
    /// Deferred and escalated subtasks do not count against the cap. The
    /// batch stops early once the task is no longer `active`.
    pub async fn run_scheduling_cycle(&self, task_id: TaskId) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let eligible =
            sort_by_priority_and_complexity(self.scheduler.find_eligible_subtasks(task_id).await?);

        for candidate in eligible {
            if report.assigned.len() >= ASSIGNMENT_BATCH_CAP {
                break;
            }
            let parent = self.store.get_task(task_id).await?;
            if parent.state != TaskState::Active {
                debug!(task = %task_id.short(), state = %parent.state, "Stopping batch");
                break;
            }

            match self.assign(&parent, candidate.id).await {
                Ok(Assignment::Assigned(_)) => report.assigned.push(candidate.id),
                Ok(Assignment::Deferred) => report.deferred.push(candidate.id),
                Ok(Assignment::Escalated(_)) => report.escalated.push(candidate.id),
                Err(
                    e @ (Error::StateConflict { .. }
                    | Error::InvalidStateTransition { .. }
                    | Error::DependencyUnsatisfied { .. }),
                ) => {
                    debug!(task = %candidate.id.short(), error = %e, "Candidate no longer assignable");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            task = %task_id.short(),
            assigned = report.assigned.len(),
            deferred = report.deferred.len(),
            "Scheduling cycle"
        );
        Ok(report)
    }

    /// Hand one subtask to a worker or a sub-coordinator.
    ///
    /// A subtask without a usable agent kind is escalated to a human rather
    /// than guessed. When the kind's quota is full the subtask stays
    /// `pending` and `parent` is queued to be woken by the next release.
    /// Otherwise a slot is taken, the subtask is activated and a run unit is
    /// submitted. A subtask that is no longer `pending` is an error, and the
    /// slot taken for the attempt is handed back.
    pub async fn assign(&self, parent: &Task, subtask_id: TaskId) -> Result<Assignment> {
        let subtask = self.store.get_task(subtask_id).await?;

        let Some(kind) = subtask.metadata.suggested_agent else {
            let question = format!(
                "Subtask \"{}\" has no known agent kind. Which agent should handle it?",
                subtask.title
            );
            return self.escalate_assignment(parent.id, &question, subtask_id).await;
        };

        if kind.role() == TaskRole::Coordinator
            && subtask.metadata.nesting_level > self.limits.max_nesting_depth
        {
            let err = Error::NestingLimit {
                task_id: subtask_id,
                level: subtask.metadata.nesting_level,
                max: self.limits.max_nesting_depth,
            };
            let question = format!(
                "Subtask \"{}\" needs further decomposition but {}. Which worker agent should handle it?",
                subtask.title, err
            );
            return self.escalate_assignment(parent.id, &question, subtask_id).await;
        }

        let parent_activity = match parent.metadata.activity_id {
            Some(id) => self.store.get_activity(id).await.ok(),
            None => None,
        };
        let activity = match &parent_activity {
            Some(spawner) => AgentActivity::spawned_by(spawner, subtask_id, kind),
            None => AgentActivity::root(subtask_id, kind),
        };
        let activity_id = activity.id;

        match self.pool.try_acquire(kind, activity_id) {
            Ok(()) => {}
            Err(e @ Error::QuotaExceeded { .. }) => {
                self.pool.defer(kind, parent.id);
                debug!(task = %subtask_id.short(), agent = %kind, "Deferred: {}", e);
                self.lifecycle
                    .notify(
                        &subtask,
                        catalog::SUBTASK_DEFERRED,
                        json!({
                            "task_id": subtask_id.to_string(),
                            "parent_id": parent.id.to_string(),
                            "agent": kind.as_str(),
                            "reason": e.to_string(),
                        }),
                    )
                    .await;
                return Ok(Assignment::Deferred);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.start(&subtask, kind, activity).await {
            self.pool.release(activity_id);
            return Err(e);
        }

        let unit = match kind.role() {
            TaskRole::Worker => WorkUnit::RunWorker {
                task_id: subtask_id,
                activity_id,
            },
            TaskRole::Coordinator => WorkUnit::RunCoordinator {
                task_id: subtask_id,
                activity_id,
            },
        };
        self.dispatcher.submit(unit).await?;
        info!(task = %subtask_id.short(), agent = %kind, "Assigned: {}", subtask.title);
        Ok(Assignment::Assigned(activity_id))
    }

    /// Activate `subtask` under `activity`.
    ///
    /// The state change is the claim: nothing about the activity is written
    /// until it succeeds, so a losing concurrent assignment leaves the
    /// winner's bookkeeping untouched.
    async fn start(&self, subtask: &Task, kind: AgentKind, activity: AgentActivity) -> Result<()> {
        let activity_id = activity.id;
        self.lifecycle
            .activate(
                subtask.id,
                json!({
                    "agent": kind.as_str(),
                    "activity_id": activity_id.to_string(),
                }),
            )
            .await?;

        let recorded: Result<Task> = async {
            self.store.insert_activity(activity).await?;
            self.store
                .update_metadata(
                    subtask.id,
                    Box::new(move |m| {
                        m.assigned_agent = Some(kind);
                        m.assigned_at = Some(Utc::now());
                        m.activity_id = Some(activity_id);
                    }),
                )
                .await
        }
        .await;

        if let Err(e) = recorded {
            warn!(task = %subtask.id.short(), error = %e, "Could not record assignment");
            if let Err(fail_err) = self
                .lifecycle
                .fail(subtask.id, &format!("assignment not recorded: {}", e))
                .await
            {
                warn!(task = %subtask.id.short(), error = %fail_err, "Could not fail unrecorded assignment");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Re-evaluate `task_id` after something changed. Idempotent.
    pub async fn evaluate_progress(&self, task_id: TaskId) -> Result<CoordinationOutcome> {
        let task = self.store.get_task(task_id).await?;
        if task.state != TaskState::Active {
            return Ok(CoordinationOutcome::Blocked(task.state));
        }

        let live: Vec<Task> = self
            .store
            .children_of(task_id)
            .await?
            .into_iter()
            .filter(|c| !c.is_retired())
            .collect();
        if live.is_empty() {
            return Ok(CoordinationOutcome::Idle);
        }

        if live.iter().all(|c| c.state == TaskState::Completed) {
            return self.finalize(&task, &live).await;
        }

        let unhandled: Vec<TaskId> = live
            .iter()
            .filter(|c| c.state == TaskState::Failed && c.metadata.recovery.is_none())
            .map(|c| c.id)
            .collect();
        if !unhandled.is_empty() {
            for failed_id in &unhandled {
                if let Err(e) = self.recovery.handle_failure(task_id, *failed_id).await {
                    warn!(task = %failed_id.short(), error = %e, "Recovery failed");
                }
            }
            if self.store.get_task(task_id).await?.state == TaskState::Active {
                self.run_scheduling_cycle(task_id).await?;
            }
            return Ok(CoordinationOutcome::Recovering {
                failures: unhandled.len(),
            });
        }

        let report = self.run_scheduling_cycle(task_id).await?;
        Ok(CoordinationOutcome::Scheduled {
            assigned: report.assigned.len(),
            deferred: report.deferred.len(),
        })
    }

    /// Merge child results and complete the task.
    async fn finalize(&self, task: &Task, children: &[Task]) -> Result<CoordinationOutcome> {
        match self.oracle.invoke(&prompts::synthesis(task, children)).await {
            Ok(response) => {
                record_usage(self.store.as_ref(), task.metadata.activity_id, &response).await;
                self.lifecycle.complete(task.id, Some(response.text)).await?;
                info!(task = %task.id.short(), "Completed: {}", task.title);
                Ok(CoordinationOutcome::Completed)
            }
            Err(e) => {
                warn!(task = %task.id.short(), error = %e, "Synthesis failed");
                self.escalate(task.id, &format!("Could not synthesize results: {}", e), None)
                    .await
            }
        }
    }

    async fn escalate(
        &self,
        task_id: TaskId,
        question: &str,
        subtask_id: Option<TaskId>,
    ) -> Result<CoordinationOutcome> {
        let request = self.human.escalate(task_id, question, true, subtask_id).await?;
        Ok(CoordinationOutcome::Escalated(request.id))
    }

    async fn escalate_assignment(
        &self,
        parent_id: TaskId,
        question: &str,
        subtask_id: TaskId,
    ) -> Result<Assignment> {
        let request = self
            .human
            .escalate(parent_id, question, true, Some(subtask_id))
            .await?;
        Ok(Assignment::Escalated(request.id))
    }

    /// Apply a human's answer about a pending subtask that could not be
    /// assigned: pick up an agent kind from the response, or fail it.
    pub async fn apply_kind_answer(&self, subtask_id: TaskId, response: &str) -> Result<Option<AgentKind>> {
        let kind = AgentKind::parse(response)
            .or_else(|| response.split_whitespace().find_map(AgentKind::parse))
            .or_else(|| AgentKind::infer(response));

        match kind {
            Some(kind) => {
                self.store
                    .update_metadata(subtask_id, Box::new(move |m| m.suggested_agent = Some(kind)))
                    .await?;
            }
            None => {
                self.lifecycle
                    .fail(subtask_id, "no agent kind could be determined")
                    .await?;
            }
        }
        Ok(kind)
    }
}
