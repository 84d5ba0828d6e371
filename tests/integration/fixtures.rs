//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An orchestrator wired to a scripted oracle and a hand-stepped queue
//! - Building decomposition replies
//! - Looking tasks up by title

use std::sync::Arc;

use cadre::config::Config;
use cadre::core::{HumanInteraction, Priority, Task, TaskId};
use cadre::events::DispatchMode;
use cadre::oracle::ScriptedOracle;
use cadre::orchestration::{Orchestrator, QueueDispatcher, RunSummary, WorkUnit};
use cadre::store::{MemoryStore, Store};

/// One subtask line-block in a decomposition reply.
pub fn subtask(title: &str, description: &str, agent: &str, deps: &str) -> String {
    format!(
        "Title: {}\nDescription: {}\nPriority: normal\nAgent: {}\nDependencies: {}\nComplexity: simple\n",
        title, description, agent, deps
    )
}

/// Join subtask blocks into a delimited decomposition reply.
pub fn plan(subtasks: &[String]) -> String {
    subtasks.join("---\n")
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<QueueDispatcher>,
    pub oracle: Arc<ScriptedOracle>,
}

impl Harness {
    pub fn new(oracle: ScriptedOracle) -> Self {
        Self::with_config(oracle, Config::default())
    }

    pub fn with_config(oracle: ScriptedOracle, config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueDispatcher::new());
        let oracle = Arc::new(oracle);
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            oracle.clone(),
            queue.clone(),
            DispatchMode::Sync,
        );
        Self {
            orchestrator,
            store,
            queue,
            oracle,
        }
    }

    pub async fn submit(&self, title: &str, description: &str) -> TaskId {
        self.orchestrator
            .submit(title, description, Priority::Normal)
            .await
            .expect("submit")
    }

    /// Execute the next queued unit, asserting it succeeded.
    pub async fn step(&self) -> WorkUnit {
        let (unit, outcome) = self
            .orchestrator
            .step(&self.queue)
            .await
            .expect("queue should not be empty");
        outcome.unwrap_or_else(|e| panic!("{:?} failed: {}", unit, e));
        unit
    }

    pub async fn drain(&self) -> RunSummary {
        self.orchestrator.drain(&self.queue).await
    }

    pub fn queued(&self) -> Vec<WorkUnit> {
        self.queue.pending().into_iter().map(|q| q.unit).collect()
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.store.get_task(id).await.expect("task")
    }

    pub async fn children(&self, id: TaskId) -> Vec<Task> {
        self.store.children_of(id).await.expect("children")
    }

    /// The live (not superseded) child of `parent` titled `title`.
    pub async fn child(&self, parent: TaskId, title: &str) -> Task {
        self.children(parent)
            .await
            .into_iter()
            .find(|t| t.title == title && !t.is_retired())
            .unwrap_or_else(|| panic!("no live child titled {:?}", title))
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.store
            .events()
            .await
            .expect("events")
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub async fn pending_interactions(&self) -> Vec<HumanInteraction> {
        self.orchestrator
            .pending_interactions()
            .await
            .expect("interactions")
    }
}
