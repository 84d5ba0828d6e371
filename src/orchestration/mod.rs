//! Coordination of root tasks through decomposition, scheduling,
//! execution, recovery and human escalation.
//!
//! [`Orchestrator`] owns the pieces and runs [`WorkUnit`]s; everything
//! else reacts to task state through the event bus.

pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod human;
pub mod lifecycle;
pub mod parser;
pub mod pool;
pub mod recovery;
pub mod scheduler;
pub mod worker;

pub use coordinator::{Assignment, CoordinationOutcome, Coordinator, CycleReport};
pub use dispatch::{ChannelDispatcher, QueueDispatcher, QueuedUnit, WorkDispatcher, WorkUnit};
pub use engine::{Orchestrator, RunSummary, TaskTree};
pub use human::HumanDesk;
pub use lifecycle::Lifecycle;
pub use parser::{parse_decomposition, ParseStrategy, SubtaskRecord};
pub use pool::{AgentPool, ReleasedSlot};
pub use recovery::Recovery;
pub use scheduler::{Scheduler, ASSIGNMENT_BATCH_CAP};
pub use worker::Worker;
