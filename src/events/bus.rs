//! Event bus: validated publish, priority-ordered dispatch.
//!
//! Handlers are registered per event type (or `*` for every type) with a
//! priority. Dispatch walks them highest priority first, ties in
//! registration order. A handler that errors or panics is logged and
//! recorded in the [`DispatchReport`]; the remaining handlers still run
//! and the publisher never sees the failure.

use crate::error::{Error, Result};
use crate::events::event::{Event, EventId, EventMetadata};
use crate::events::schema::{EventSchema, SchemaRegistry};
use crate::orchestration::dispatch::{WorkDispatcher, WorkUnit, EVENTS_QUEUE};
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

/// Subscribe to every event type.
pub const ALL_EVENTS: &str = "*";

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and dispatch reports.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Whether `publish` runs handlers inline or hands the event to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
}

/// What happened when an event was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: EventId,
    /// Handlers in the order they were called, failed ones included.
    pub invoked: Vec<String>,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            invoked: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handlers ran inline.
    Dispatched(DispatchReport),
    /// Handed to the events queue.
    Queued(EventId),
}

impl PublishOutcome {
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Dispatched(report) => report.event_id,
            Self::Queued(id) => *id,
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn EventHandler>,
    priority: i32,
    seq: u64,
}

pub struct EventBus {
    schemas: SchemaRegistry,
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_seq: AtomicU64,
    store: Arc<dyn Store>,
    mode: DispatchMode,
    dispatcher: Option<Arc<dyn WorkDispatcher>>,
}

impl EventBus {
    /// Bus that dispatches inline.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            schemas: SchemaRegistry::new(),
            handlers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            store,
            mode: DispatchMode::Sync,
            dispatcher: None,
        }
    }

    /// Bus that hands every published event to the `events` queue.
    pub fn queued(store: Arc<dyn Store>, dispatcher: Arc<dyn WorkDispatcher>) -> Self {
        Self {
            mode: DispatchMode::Async,
            dispatcher: Some(dispatcher),
            ..Self::new(store)
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn register_schema(&self, event_type: &str, schema: EventSchema) {
        self.schemas.register_schema(event_type, schema);
    }

    pub fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>, priority: i32) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(event_type, handler = handler.name(), priority, "register handler");
        // a panicking writer can only leave a whole, sorted list behind
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(event_type.to_string()).or_default();
        list.push(Registration {
            handler,
            priority,
            seq,
        });
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    /// Handlers for `event_type` in dispatch order, wildcard ones merged in.
    fn handlers_for(&self, event_type: &str) -> Vec<Registration> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut merged: Vec<Registration> = handlers
            .get(event_type)
            .into_iter()
            .chain(handlers.get(ALL_EVENTS))
            .flatten()
            .cloned()
            .collect();
        merged.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        merged
    }

    /// Names of the handlers `event_type` would be dispatched to, in order.
    pub fn handler_names(&self, event_type: &str) -> Vec<String> {
        self.handlers_for(event_type)
            .iter()
            .map(|r| r.handler.name().to_string())
            .collect()
    }

    /// Validate, store, then dispatch (or enqueue) an event.
    ///
    /// Invalid payloads are logged and rejected before anything is stored.
    pub async fn publish(
        &self,
        event_type: &str,
        data: Value,
        metadata: EventMetadata,
    ) -> Result<PublishOutcome> {
        let event = Event::new(event_type, data, metadata);

        if let Err(missing) = self.schemas.validate(&event) {
            warn!(event_type, ?missing, "Rejected event with invalid payload");
            return Err(Error::Validation {
                event_type: event_type.to_string(),
                missing,
            });
        }

        self.store.insert_event(event.clone()).await?;

        match (&self.mode, &self.dispatcher) {
            (DispatchMode::Async, Some(dispatcher)) => {
                dispatcher
                    .enqueue(WorkUnit::DispatchEvent { event_id: event.id }, EVENTS_QUEUE)
                    .await?;
                Ok(PublishOutcome::Queued(event.id))
            }
            _ => Ok(PublishOutcome::Dispatched(self.dispatch(&event).await)),
        }
    }

    /// Dispatch a previously stored event (the `DispatchEvent` work unit).
    pub async fn dispatch_stored(&self, event_id: EventId) -> Result<DispatchReport> {
        let event = self.store.get_event(event_id).await?;
        Ok(self.dispatch(&event).await)
    }

    /// Run every handler for the event in priority order.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::new(event.id);

        for registration in self.handlers_for(&event.event_type) {
            let name = registration.handler.name().to_string();
            report.invoked.push(name.clone());

            let outcome = AssertUnwindSafe(registration.handler.handle(event))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            if let Some(message) = failure {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    handler = %name,
                    error = %message,
                    "Event handler failed"
                );
                report.failures.push(HandlerFailure {
                    handler: name,
                    error: message,
                });
            }
        }

        if let Err(e) = self.store.mark_event_processed(event.id, Utc::now()).await {
            warn!(event_id = %event.id, error = %e, "Could not mark event processed");
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
