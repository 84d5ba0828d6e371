//! Built-in event handlers.
//!
//! | handler | events | priority |
//! |---|---|---|
//! | [`AuditHandler`] | every event | 90 |
//! | [`ActivityHandler`] | task/subtask completed or failed | 50 |
//! | [`CoordinationHandler`] | subtask completed or failed, human answers | 20 |

use crate::error::Result;
use crate::events::{catalog, Event, EventBus, EventHandler, ALL_EVENTS};
use crate::orchestration::dispatch::{WorkDispatcher, WorkUnit};
use crate::orchestration::pool::AgentPool;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

// Higher runs first. Activity bookkeeping must see a completion before
// coordination reacts to it.
pub const AUDIT_PRIORITY: i32 = 90;
pub const ACTIVITY_PRIORITY: i32 = 50;
pub const COORDINATION_PRIORITY: i32 = 20;

/// Logs every event.
pub struct AuditHandler;

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        "audit"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            task = event.str_field("task_id").unwrap_or("-"),
            "event"
        );
        Ok(())
    }
}

/// Closes the finished task's activity and frees its pool slot.
///
/// Coordinators that deferred work for lack of that slot get a fresh
/// coordination cycle.
pub struct ActivityHandler {
    store: Arc<dyn Store>,
    pool: Arc<AgentPool>,
    dispatcher: Arc<dyn WorkDispatcher>,
}

impl ActivityHandler {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<AgentPool>,
        dispatcher: Arc<dyn WorkDispatcher>,
    ) -> Self {
        Self {
            store,
            pool,
            dispatcher,
        }
    }
}

#[async_trait]
impl EventHandler for ActivityHandler {
    fn name(&self) -> &str {
        "activity"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Some(task_id) = event.task_id_field("task_id") else {
            return Ok(());
        };
        let task = self.store.get_task(task_id).await?;
        let Some(activity_id) = task.metadata.activity_id else {
            return Ok(());
        };

        let mut activity = self.store.get_activity(activity_id).await?;
        if activity.is_running() {
            activity.finish(event.event_type.ends_with(".completed"));
            self.store.update_activity(activity).await?;
        }

        if let Some(released) = self.pool.release(activity_id) {
            for coordinator in released.waiting {
                debug!(task = %coordinator.short(), agent = %released.kind, "Slot freed, waking coordinator");
                self.dispatcher
                    .submit(WorkUnit::CoordinationCycle {
                        task_id: coordinator,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Re-enters the owning coordinator's progress loop.
pub struct CoordinationHandler {
    dispatcher: Arc<dyn WorkDispatcher>,
}

impl CoordinationHandler {
    pub fn new(dispatcher: Arc<dyn WorkDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventHandler for CoordinationHandler {
    fn name(&self) -> &str {
        "coordination"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let field = if event.event_type == catalog::HUMAN_INTERACTION_ANSWERED {
            "task_id"
        } else {
            "parent_id"
        };
        if let Some(task_id) = event.task_id_field(field) {
            self.dispatcher
                .submit(WorkUnit::CoordinationCycle { task_id })
                .await?;
        }
        Ok(())
    }
}

/// Register the built-in handlers on `bus`.
pub fn register_builtin(
    bus: &EventBus,
    store: Arc<dyn Store>,
    pool: Arc<AgentPool>,
    dispatcher: Arc<dyn WorkDispatcher>,
) {
    bus.register_handler(ALL_EVENTS, Arc::new(AuditHandler), AUDIT_PRIORITY);

    let activity = Arc::new(ActivityHandler::new(store, pool, dispatcher.clone()));
    for event_type in [
        catalog::SUBTASK_COMPLETED,
        catalog::SUBTASK_FAILED,
        catalog::TASK_COMPLETED,
        catalog::TASK_FAILED,
    ] {
        bus.register_handler(event_type, activity.clone(), ACTIVITY_PRIORITY);
    }

    let coordination = Arc::new(CoordinationHandler::new(dispatcher));
    for event_type in [
        catalog::SUBTASK_COMPLETED,
        catalog::SUBTASK_FAILED,
        catalog::HUMAN_INTERACTION_ANSWERED,
    ] {
        bus.register_handler(event_type, coordination.clone(), COORDINATION_PRIORITY);
    }
}
