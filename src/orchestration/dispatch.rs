//! Work dispatch: the "enqueue a unit of work" seam.
//!
//! The core never runs coordinators, workers or queued event dispatch
//! inline. It hands a [`WorkUnit`] to a [`WorkDispatcher`] and something
//! else (the orchestrator's worker pool, or a test stepping a queue) picks
//! it up.

use crate::core::{ActivityId, TaskId};
use crate::error::{Error, Result};
use crate::events::EventId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Queued event dispatch.
pub const EVENTS_QUEUE: &str = "events";
/// Coordinator runs and progress re-evaluations.
pub const COORDINATORS_QUEUE: &str = "coordinators";
pub const WORKERS_QUEUE: &str = "workers";

/// An opaque unit of asynchronous work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    /// Run the bus handlers for a stored event.
    DispatchEvent { event_id: EventId },
    /// Decompose a task and start scheduling its subtasks.
    RunCoordinator {
        task_id: TaskId,
        activity_id: ActivityId,
    },
    /// Execute a leaf subtask.
    RunWorker {
        task_id: TaskId,
        activity_id: ActivityId,
    },
    /// Re-evaluate a coordinator task's progress.
    CoordinationCycle { task_id: TaskId },
}

impl WorkUnit {
    /// Queue this unit belongs on.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::DispatchEvent { .. } => EVENTS_QUEUE,
            Self::RunCoordinator { .. } | Self::CoordinationCycle { .. } => COORDINATORS_QUEUE,
            Self::RunWorker { .. } => WORKERS_QUEUE,
        }
    }
}

/// A unit together with the queue it was enqueued on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUnit {
    pub queue: String,
    pub unit: WorkUnit,
}

/// Something that accepts units of work for later execution.
///
/// Implementations only have to be durable enough for their deployment;
/// nothing here waits for a unit to run.
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Enqueue `unit` on the named queue.
    async fn enqueue(&self, unit: WorkUnit, queue: &str) -> Result<()>;

    /// Enqueue on the unit's own queue.
    async fn submit(&self, unit: WorkUnit) -> Result<()> {
        let queue = unit.queue();
        self.enqueue(unit, queue).await
    }
}

/// Dispatcher backed by an unbounded tokio channel.
///
/// The receiving half is drained by `Orchestrator::run`.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<QueuedUnit>,
}

impl ChannelDispatcher {
    /// Dispatcher and the receiver its units arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedUnit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkDispatcher for ChannelDispatcher {
    async fn enqueue(&self, unit: WorkUnit, queue: &str) -> Result<()> {
        trace!(?unit, queue, "enqueue");
        self.tx
            .send(QueuedUnit {
                queue: queue.to_string(),
                unit,
            })
            .map_err(|e| Error::Dispatch(format!("work channel closed: {}", e)))
    }
}

/// FIFO dispatcher that holds units until someone pops them.
#[derive(Debug, Default)]
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<QueuedUnit>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest unit.
    pub fn pop(&self) -> Option<QueuedUnit> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued units, front first.
    pub fn pending(&self) -> Vec<QueuedUnit> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkDispatcher for QueueDispatcher {
    async fn enqueue(&self, unit: WorkUnit, queue: &str) -> Result<()> {
        trace!(?unit, queue, "enqueue");
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(QueuedUnit {
            queue: queue.to_string(),
            unit,
        });
        Ok(())
    }
}
