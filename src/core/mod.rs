//! Core domain models for cadre.
//!
//! Tasks and their state machine, the sibling dependency graph, agent
//! activities and human interaction records.

pub mod activity;
pub mod dag;
pub mod human;
pub mod task;

pub use activity::{ActivityId, ActivityStatus, AgentActivity};
pub use dag::DependencyGraph;
pub use human::{HumanInteraction, InteractionId, InteractionStatus, InteractionType};
pub use task::{
    AgentKind, Complexity, Priority, RecoveryAction, Task, TaskId, TaskMetadata, TaskRole,
    TaskState,
};
