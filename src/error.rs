use thiserror::Error;

use crate::core::activity::ActivityId;
use crate::core::human::InteractionId;
use crate::core::task::{AgentKind, TaskId, TaskState};
use crate::events::EventId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Event {event_type} failed validation: {}", missing.join(", "))]
    Validation {
        event_type: String,
        missing: Vec<String>,
    },

    #[error("Invalid state transition for task {task_id} from {from} to {to}: {reason}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
        reason: String,
    },

    #[error("Task {task_id} state changed concurrently (expected {expected}, found {actual})")]
    StateConflict {
        task_id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("Task {task_id} has {} unmet dependencies", unmet.len())]
    DependencyUnsatisfied { task_id: TaskId, unmet: Vec<TaskId> },

    #[error("Concurrency quota for {agent} exhausted (max: {max})")]
    QuotaExceeded { agent: AgentKind, max: usize },

    #[error("Could not parse decomposition: {0}")]
    DecompositionParse(String),

    #[error("Oracle invocation failed: {0}")]
    Oracle(String),

    #[error("Oracle timed out after {0:?}")]
    OracleTimeout(std::time::Duration),

    #[error("Oracle binary not found: {0}")]
    OracleBinaryNotFound(String),

    #[error("Nesting level {level} for task {task_id} exceeds maximum {max}")]
    NestingLimit { task_id: TaskId, level: u32, max: u32 },

    #[error("Subtask budget for root task {root_id} exhausted (max: {max})")]
    SubtaskBudgetExhausted { root_id: TaskId, max: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Human interaction not found: {0}")]
    InteractionNotFound(InteractionId),

    #[error("Human interaction {0} is no longer pending")]
    InteractionNotPending(InteractionId),

    #[error("Human interaction {0} is required and must be answered")]
    InteractionRequired(InteractionId),

    #[error("Agent activity not found: {0}")]
    ActivityNotFound(ActivityId),

    #[error("Work dispatch failed: {0}")]
    Dispatch(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors raised by the reasoning oracle, which callers may retry or escalate.
    pub fn is_oracle_failure(&self) -> bool {
        matches!(
            self,
            Error::Oracle(_) | Error::OracleTimeout(_) | Error::OracleBinaryNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
