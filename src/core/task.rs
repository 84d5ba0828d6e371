//! Task data model and lifecycle state machine.
//!
//! Tasks are the units of work a coordinator decomposes and schedules.
//! A task's state only moves along the edges allowed by
//! [`TaskState::can_transition_to`]; guards that need the rest of the graph
//! (children completed, dependencies satisfied) live in
//! `orchestration::lifecycle` where fresh state can be fetched.

use crate::core::activity::ActivityId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet picked up.
    #[default]
    Pending,
    /// Being worked on by a worker or coordinator.
    Active,
    /// Blocked on a required human response.
    WaitingOnHuman,
    /// Administratively paused; receives no new assignments.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskState {
    /// Check if the state machine has an edge from `self` to `target`.
    ///
    /// This only covers the shape of the graph. The completion guard
    /// (all children completed) and the waiting guards are enforced by
    /// the lifecycle operations.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        match (self, target) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Pending, Active)
            | (Active, WaitingOnHuman)
            | (WaitingOnHuman, Active)
            | (Active, Completed)
            | (WaitingOnHuman, Completed)
            | (Active, Paused)
            | (Paused, Active) => true,
            _ => false,
        }
    }

    /// Edges out of `failed` that only failure recovery may take:
    /// RETRY requeues to `pending`, SKIP closes as `completed`.
    pub fn can_recover_to(&self, target: TaskState) -> bool {
        matches!(
            (self, target),
            (TaskState::Failed, TaskState::Pending) | (TaskState::Failed, TaskState::Completed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::WaitingOnHuman => "waiting_on_human",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank: lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Case-insensitive. `medium` is read as normal; there is nothing above high.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "normal" | "medium" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much further work a subtask is expected to need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Sort rank: lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Simple => 0,
            Self::Moderate => 1,
            Self::Complex => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" | "easy" | "low" => Some(Self::Simple),
            "moderate" | "medium" => Some(Self::Moderate),
            "complex" | "hard" | "high" => Some(Self::Complex),
            _ => None,
        }
    }

    /// Estimate complexity from the size of a description.
    pub fn infer(description: &str) -> Self {
        match description.split_whitespace().count() {
            0..=24 => Self::Simple,
            25..=79 => Self::Moderate,
            _ => Self::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of agent kinds a subtask can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "CoordinatorAgent")]
    Coordinator,
    #[serde(rename = "ResearcherAgent")]
    Researcher,
    #[serde(rename = "WriterAgent")]
    Writer,
    #[serde(rename = "CoderAgent")]
    Coder,
    #[serde(rename = "AnalystAgent")]
    Analyst,
    #[serde(rename = "ReviewerAgent")]
    Reviewer,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Coordinator,
        AgentKind::Researcher,
        AgentKind::Writer,
        AgentKind::Coder,
        AgentKind::Analyst,
        AgentKind::Reviewer,
    ];

    /// Parse an oracle-suggested agent name.
    ///
    /// Accepts `WriterAgent`, `writer`, `Writer Agent`, `writer_agent`.
    /// Anything else is unknown and returns `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        let stem = normalized.strip_suffix("agent").unwrap_or(&normalized);

        match stem {
            "coordinator" | "orchestrator" => Some(Self::Coordinator),
            "researcher" | "research" | "webresearcher" => Some(Self::Researcher),
            "writer" | "writing" | "author" => Some(Self::Writer),
            "coder" | "code" | "developer" | "programmer" => Some(Self::Coder),
            "analyst" | "analyzer" | "analysis" => Some(Self::Analyst),
            "reviewer" | "review" | "editor" => Some(Self::Reviewer),
            _ => None,
        }
    }

    /// Guess a worker kind from keywords in a description.
    pub fn infer(description: &str) -> Option<Self> {
        let lower = description.to_lowercase();
        const HINTS: &[(&str, AgentKind)] = &[
            ("research", AgentKind::Researcher),
            ("investigate", AgentKind::Researcher),
            ("implement", AgentKind::Coder),
            ("code", AgentKind::Coder),
            ("analy", AgentKind::Analyst),
            ("review", AgentKind::Reviewer),
            ("proofread", AgentKind::Reviewer),
            ("write", AgentKind::Writer),
            ("draft", AgentKind::Writer),
        ];
        HINTS
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "CoordinatorAgent",
            Self::Researcher => "ResearcherAgent",
            Self::Writer => "WriterAgent",
            Self::Coder => "CoderAgent",
            Self::Analyst => "AnalystAgent",
            Self::Reviewer => "ReviewerAgent",
        }
    }

    pub fn role(&self) -> TaskRole {
        match self {
            Self::Coordinator => TaskRole::Coordinator,
            _ => TaskRole::Worker,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution path for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    /// Executed directly by a worker.
    Worker,
    /// Decomposed further by a sub-coordinator.
    Coordinator,
}

/// Recovery policy chosen for a failed subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Retry,
    Redefine,
    Split,
    Human,
    Skip,
}

impl RecoveryAction {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_uppercase().as_str() {
            "RETRY" => Some(Self::Retry),
            "REDEFINE" => Some(Self::Redefine),
            "SPLIT" => Some(Self::Split),
            "HUMAN" => Some(Self::Human),
            "SKIP" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Redefine => "REDEFINE",
            Self::Split => "SPLIT",
            Self::Human => "HUMAN",
            Self::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling metadata carried by every task.
///
/// The typed fields are the ones the scheduler reads; `extra` is an open
/// bag for collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub suggested_agent: Option<AgentKind>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub nesting_level: u32,
    #[serde(default)]
    pub assigned_agent: Option<AgentKind>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Activity currently (or last) executing this task.
    #[serde(default)]
    pub activity_id: Option<ActivityId>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set once a recovery policy has been chosen for this failure.
    #[serde(default)]
    pub recovery: Option<RecoveryAction>,
    /// Replacement subtask created by REDEFINE or SPLIT.
    #[serde(default)]
    pub superseded_by: Option<TaskId>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub priority: Priority,
    /// Owning coordinator task.
    pub parent_id: Option<TaskId>,
    /// Sibling tasks that must be completed first. Ordered, no duplicates.
    pub depends_on_task_ids: Vec<TaskId>,
    pub metadata: TaskMetadata,
    /// Final textual artifact.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new root task in `pending`.
    pub fn new(title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            state: TaskState::Pending,
            priority: Priority::Normal,
            parent_id: None,
            depends_on_task_ids: Vec::new(),
            metadata: TaskMetadata::default(),
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a subtask owned by `parent`, one nesting level deeper.
    pub fn child_of(parent: &Task, title: &str, description: &str) -> Self {
        let mut task = Self::new(title, description);
        task.parent_id = Some(parent.id);
        task.metadata.nesting_level = parent.metadata.nesting_level + 1;
        task
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent: AgentKind) -> Self {
        self.metadata.suggested_agent = Some(agent);
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.metadata.complexity = Some(complexity);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.set_dependencies(deps);
        self
    }

    /// Replace the dependency set, dropping duplicates and self-references.
    pub fn set_dependencies(&mut self, deps: Vec<TaskId>) {
        let mut unique = Vec::with_capacity(deps.len());
        for dep in deps {
            if dep != self.id && !unique.contains(&dep) {
                unique.push(dep);
            }
        }
        self.depends_on_task_ids = unique;
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Complexity recorded at decomposition, or moderate when unknown.
    pub fn complexity(&self) -> Complexity {
        self.metadata.complexity.unwrap_or(Complexity::Moderate)
    }

    /// Execution path for this task, if its agent kind is known.
    pub fn role(&self) -> Option<TaskRole> {
        self.metadata.suggested_agent.map(|kind| kind.role())
    }

    /// A failed subtask that recovery replaced with another subtask.
    pub fn is_retired(&self) -> bool {
        self.state == TaskState::Failed && self.metadata.superseded_by.is_some()
    }

    /// Check the state machine edge, failing loudly on illegal transitions.
    pub fn check_transition(&self, target: TaskState) -> Result<()> {
        if self.state.can_transition_to(target) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                task_id: self.id,
                from: self.state,
                to: target,
                reason: "no such edge in the task state machine".to_string(),
            })
        }
    }

    /// Apply a state change and its timestamps. Callers check legality first.
    pub fn apply_state(&mut self, target: TaskState) {
        let now = Utc::now();
        if target == TaskState::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.completed_at = Some(now);
        } else {
            self.completed_at = None;
        }
        self.state = target;
        self.updated_at = now;
    }

    /// Dependency ids whose task is not `completed` according to `lookup`.
    ///
    /// Ids that cannot be resolved count as unmet.
    pub fn unmet_dependencies<F>(&self, lookup: F) -> Vec<TaskId>
    where
        F: Fn(&TaskId) -> Option<TaskState>,
    {
        self.depends_on_task_ids
            .iter()
            .filter(|dep| lookup(dep) != Some(TaskState::Completed))
            .copied()
            .collect()
    }

    /// True iff every dependency resolves to a `completed` task.
    ///
    /// Vacuously true when there are no dependencies.
    pub fn dependencies_satisfied<F>(&self, lookup: F) -> bool
    where
        F: Fn(&TaskId) -> Option<TaskState>,
    {
        self.depends_on_task_ids
            .iter()
            .all(|dep| lookup(dep) == Some(TaskState::Completed))
    }
}
