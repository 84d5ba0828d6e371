//! Orchestrator: wires the store, bus, pool, coordinator and worker, and
//! runs work units.
//!
//! Units arrive through a [`WorkDispatcher`]. [`Orchestrator::run`] drains
//! a [`ChannelDispatcher`](super::dispatch::ChannelDispatcher) receiver
//! with a bounded pool of tokio tasks; [`Orchestrator::drain`] and
//! [`Orchestrator::step`] process a [`QueueDispatcher`] one unit at a time.

use crate::config::Config;
use crate::core::{
    AgentActivity, AgentKind, HumanInteraction, InteractionId, Priority, Task, TaskId, TaskState,
};
use crate::error::{Error, Result};
use crate::events::{catalog, DispatchMode, EventBus};
use crate::oracle::Oracle;
use crate::orchestration::coordinator::{CoordinationOutcome, Coordinator};
use crate::orchestration::dispatch::{QueueDispatcher, QueuedUnit, WorkDispatcher, WorkUnit};
use crate::orchestration::handlers::register_builtin;
use crate::orchestration::human::HumanDesk;
use crate::orchestration::lifecycle::Lifecycle;
use crate::orchestration::pool::AgentPool;
use crate::orchestration::worker::Worker;
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from a run or drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Result<()>) {
        match outcome {
            Ok(()) => self.executed += 1,
            Err(e) => {
                warn!(error = %e, "Work unit failed");
                self.failed += 1;
            }
        }
    }

    fn record_join(&mut self, joined: std::result::Result<Result<()>, JoinError>) {
        match joined {
            Ok(outcome) => self.record(&outcome),
            Err(e) => {
                error!(error = %e, "Work unit task aborted");
                self.failed += 1;
            }
        }
    }
}

/// A task and its descendants.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTree {
    pub task: Task,
    pub children: Vec<TaskTree>,
}

impl TaskTree {
    /// Load `id` and its descendants from `store`.
    pub fn load(store: &dyn Store, id: TaskId) -> BoxFuture<'_, Result<TaskTree>> {
        async move {
            let task = store.get_task(id).await?;
            let mut children = Vec::new();
            for child in store.children_of(id).await? {
                children.push(TaskTree::load(store, child.id).await?);
            }
            Ok(TaskTree { task, children })
        }
        .boxed()
    }

    /// Number of tasks in the tree, root included.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(TaskTree::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Indented one-line-per-task view.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let agent = self
            .task
            .metadata
            .assigned_agent
            .or(self.task.metadata.suggested_agent)
            .map(|k| format!(" <{}>", k))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}[{}] {} {}{}\n",
            "  ".repeat(depth),
            self.task.state,
            self.task.id.short(),
            self.task.title,
            agent
        ));
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

/// The assembled system: store, bus, pool and the runners that share them.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    dispatcher: Arc<dyn WorkDispatcher>,
    pool: Arc<AgentPool>,
    lifecycle: Lifecycle,
    human: HumanDesk,
    coordinator: Coordinator,
    worker: Worker,
}

impl Orchestrator {
    /// Wire every component against `store` and `oracle`.
    ///
    /// `mode` decides whether the bus runs handlers inline or hands each
    /// event to `dispatcher` as a `DispatchEvent` unit. The default schemas
    /// and the built-in handlers are registered here.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        oracle: Arc<dyn Oracle>,
        dispatcher: Arc<dyn WorkDispatcher>,
        mode: DispatchMode,
    ) -> Self {
        let bus = Arc::new(match mode {
            DispatchMode::Sync => EventBus::new(store.clone()),
            DispatchMode::Async => EventBus::queued(store.clone(), dispatcher.clone()),
        });
        catalog::register_defaults(bus.schemas());

        let pool = Arc::new(AgentPool::new(&config.quotas));
        register_builtin(&bus, store.clone(), pool.clone(), dispatcher.clone());

        let lifecycle = Lifecycle::new(store.clone(), bus.clone());
        let human = HumanDesk::new(lifecycle.clone(), &config.human);
        let coordinator = Coordinator::new(
            oracle.clone(),
            lifecycle.clone(),
            pool.clone(),
            dispatcher.clone(),
            human.clone(),
            config.limits,
        );
        let worker = Worker::new(oracle, lifecycle.clone(), pool.clone());

        Self {
            config,
            store,
            bus,
            dispatcher,
            pool,
            lifecycle,
            human,
            coordinator,
            worker,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Shared slot accounting, mostly useful for inspection.
    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Create a root task and queue its coordinator.
    pub async fn submit(&self, title: &str, description: &str, priority: Priority) -> Result<TaskId> {
        let task = Task::new(title, description)
            .with_priority(priority)
            .with_agent(AgentKind::Coordinator);
        let task_id = task.id;
        self.store.insert_task(task).await?;

        let activity = AgentActivity::root(task_id, AgentKind::Coordinator);
        let activity_id = activity.id;
        self.store.insert_activity(activity).await?;
        let task = self
            .store
            .update_metadata(
                task_id,
                Box::new(move |m| {
                    m.assigned_agent = Some(AgentKind::Coordinator);
                    m.activity_id = Some(activity_id);
                }),
            )
            .await?;

        self.lifecycle
            .notify(
                &task,
                catalog::TASK_CREATED,
                json!({
                    "task_id": task_id.to_string(),
                    "title": task.title,
                    "priority": task.priority.as_str(),
                }),
            )
            .await;

        self.dispatcher
            .submit(WorkUnit::RunCoordinator {
                task_id,
                activity_id,
            })
            .await?;
        info!(task = %task_id.short(), "Submitted: {}", title);
        Ok(task_id)
    }

    /// Run one work unit to completion.
    ///
    /// A coordinator run that errors fails its task before the error is
    /// returned, so no task is left `active` with nothing driving it.
    /// Worker errors are already recorded on the task by the worker.
    pub async fn execute(&self, unit: WorkUnit) -> Result<()> {
        debug!(?unit, "execute");
        match unit {
            WorkUnit::DispatchEvent { event_id } => {
                self.bus.dispatch_stored(event_id).await?;
            }
            WorkUnit::RunCoordinator {
                task_id,
                activity_id,
            } => {
                let outcome = match self.coordinator.run(task_id, activity_id).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(task = %task_id.short(), error = %e, "Coordinator failed");
                        if let Err(fail_err) = self.lifecycle.fail(task_id, &e.to_string()).await {
                            debug!(task = %task_id.short(), error = %fail_err, "Could not fail task");
                        }
                        return Err(e);
                    }
                };
                debug!(task = %task_id.short(), ?outcome, "Coordinator ran");
            }
            WorkUnit::RunWorker {
                task_id,
                activity_id,
            } => {
                self.worker.run(task_id, activity_id).await?;
            }
            WorkUnit::CoordinationCycle { task_id } => {
                let outcome = self.coordinator.evaluate_progress(task_id).await?;
                if outcome != CoordinationOutcome::Idle {
                    debug!(task = %task_id.short(), ?outcome, "Coordination cycle");
                }
            }
        }
        Ok(())
    }

    /// Execute units from `rx` on up to `engine.max_parallel_units` tokio
    /// tasks until the channel is idle or `cancel` fires.
    ///
    /// Cancellation stops taking new units; units already running finish.
    pub async fn run(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<QueuedUnit>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let width = self.config.engine.max_parallel_units.max(1);
        let mut summary = RunSummary::default();
        let mut running: JoinSet<Result<()>> = JoinSet::new();

        loop {
            while let Some(joined) = running.try_join_next() {
                summary.record_join(joined);
            }
            if cancel.is_cancelled() {
                info!("Orchestrator cancelled");
                break;
            }

            if running.len() >= width {
                tokio::select! {
                    Some(joined) = running.join_next() => summary.record_join(joined),
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            match rx.try_recv() {
                Ok(queued) => self.spawn_unit(&mut running, queued),
                Err(TryRecvError::Empty) if running.is_empty() => {
                    debug!("Orchestrator idle");
                    break;
                }
                Err(TryRecvError::Empty) => {
                    tokio::select! {
                        Some(queued) = rx.recv() => self.spawn_unit(&mut running, queued),
                        Some(joined) = running.join_next() => summary.record_join(joined),
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(TryRecvError::Disconnected) => match running.join_next().await {
                    Some(joined) => summary.record_join(joined),
                    None => break,
                },
            }
        }

        while let Some(joined) = running.join_next().await {
            summary.record_join(joined);
        }
        info!(executed = summary.executed, failed = summary.failed, "Orchestrator stopped");
        summary
    }

    fn spawn_unit(self: &Arc<Self>, running: &mut JoinSet<Result<()>>, queued: QueuedUnit) {
        let this = Arc::clone(self);
        running.spawn(async move { this.execute(queued.unit).await });
    }

    /// Execute the next unit from `queue`, if any.
    pub async fn step(&self, queue: &QueueDispatcher) -> Option<(WorkUnit, Result<()>)> {
        let queued = queue.pop()?;
        let outcome = self.execute(queued.unit).await;
        Some((queued.unit, outcome))
    }

    /// Execute units from `queue` one at a time until it is empty.
    pub async fn drain(&self, queue: &QueueDispatcher) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some((_, outcome)) = self.step(queue).await {
            summary.record(&outcome);
        }
        summary
    }

    /// Pause an `active` task. Running children finish; nothing new is assigned.
    pub async fn pause(&self, task_id: TaskId) -> Result<Task> {
        self.lifecycle.pause(task_id).await
    }

    /// Resume a paused task and re-run its scheduling.
    pub async fn unpause(&self, task_id: TaskId) -> Result<Task> {
        let task = self.lifecycle.unpause(task_id).await?;
        self.dispatcher
            .submit(WorkUnit::CoordinationCycle { task_id })
            .await?;
        Ok(task)
    }

    /// Answer a human interaction.
    ///
    /// A response about a failed subtask is a recovery decision; one about
    /// a subtask that could not be assigned names its agent kind.
    pub async fn answer(&self, id: InteractionId, response: &str) -> Result<HumanInteraction> {
        let interaction = self.store.get_interaction(id).await?;
        if !interaction.is_pending() {
            return Err(Error::InteractionNotPending(id));
        }

        if let Some(subtask_id) = interaction.subtask_id {
            let subtask = self.store.get_task(subtask_id).await?;
            match subtask.state {
                TaskState::Failed => {
                    self.coordinator
                        .recovery()
                        .apply_human_decision(interaction.task_id, subtask_id, response)
                        .await?;
                }
                TaskState::Pending => {
                    self.coordinator.apply_kind_answer(subtask_id, response).await?;
                }
                _ => {}
            }
        }

        self.human.answer(id, response).await
    }

    /// Dismiss an advisory interaction.
    pub async fn ignore(&self, id: InteractionId) -> Result<HumanInteraction> {
        self.human.ignore(id).await
    }

    pub async fn expire_interactions(&self, now: DateTime<Utc>) -> Result<Vec<InteractionId>> {
        self.human.expire_interactions(now).await
    }

    /// Every unanswered interaction across all projects.
    pub async fn pending_interactions(&self) -> Result<Vec<HumanInteraction>> {
        self.store.pending_interactions(None).await
    }

    /// The root task above `id`.
    pub async fn root_of(&self, id: TaskId) -> Result<TaskId> {
        let task = self.store.get_task(id).await?;
        Ok(self.lifecycle.root_of(&task).await)
    }

    /// `root` and all its descendants.
    pub async fn task_tree(&self, root: TaskId) -> Result<TaskTree> {
        TaskTree::load(self.store.as_ref(), root).await
    }
}
