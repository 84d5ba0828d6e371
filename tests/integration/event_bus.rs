//! Event bus tests: payload schemas and handler isolation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use cadre::config::Config;
use cadre::events::{
    catalog, DispatchMode, Event, EventBus, EventHandler, EventMetadata, EventSchema,
    PublishOutcome,
};
use cadre::oracle::ScriptedOracle;
use cadre::orchestration::{Orchestrator, QueueDispatcher, WorkUnit};
use cadre::store::{MemoryStore, Store};
use cadre::{Error, Result};

use crate::fixtures::{plan, subtask};

/// Records the events it sees; optionally fails every one.
struct Recorder {
    name: &'static str,
    fail: bool,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn new(name: &'static str, fail: bool) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Self {
            name,
            fail,
            seen: seen.clone(),
        });
        (recorder, seen)
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        self.seen.lock().unwrap().push(event.event_type.clone());
        if self.fail {
            return Err(Error::Dispatch(format!("{} refused", self.name)));
        }
        Ok(())
    }
}

/// Test: Schema enforcement
/// Given a type requiring field `a`
/// When events with and without `a` are published
/// Then only the valid one is stored, and the error names the field
#[tokio::test]
async fn test_schema_rejects_missing_required_field() {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store.clone());
    bus.register_schema("test.event", EventSchema::new(&["a"], &[]));

    assert_ok!(bus.publish("test.event", json!({"a": 1}), EventMetadata::new()).await);
    let err = assert_err!(bus.publish("test.event", json!({}), EventMetadata::new()).await);

    match err {
        Error::Validation { event_type, missing } => {
            assert_eq!(event_type, "test.event");
            assert!(missing.iter().any(|m| m.contains('a')));
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
    assert_eq!(store.events().await.unwrap().len(), 1);
}

/// Test: Handler isolation
/// Given a failing handler at priority 90 and a healthy one at 10
/// When an event is published
/// Then both run in priority order and only the first is reported failed
#[tokio::test]
async fn test_failing_handler_is_isolated() {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store.clone());
    bus.register_schema("test.ping", EventSchema::new(&[], &[]));
    let (h1, seen1) = Recorder::new("h1", true);
    let (h2, seen2) = Recorder::new("h2", false);
    bus.register_handler("test.ping", h2, 10);
    bus.register_handler("test.ping", h1, 90);

    let outcome = assert_ok!(bus.publish("test.ping", json!({}), EventMetadata::new()).await);

    let PublishOutcome::Dispatched(report) = outcome else {
        panic!("sync bus should dispatch inline");
    };
    assert_eq!(report.invoked, vec!["h1", "h2"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].handler, "h1");
    assert_eq!(seen1.lock().unwrap().len(), 1);
    assert_eq!(*seen2.lock().unwrap(), vec!["test.ping"]);

    let stored = store.get_event(report.event_id).await.unwrap();
    assert!(stored.processed_at.is_some());
}

/// Test: Custom handlers slot in by priority
/// Given a handler registered at priority 30 on subtask.completed
/// When a project runs in queued mode
/// Then it sees each completion between the built-in activity and coordination handlers
#[tokio::test]
async fn test_custom_handler_interleaves_with_builtins() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(QueueDispatcher::new());
    let oracle = ScriptedOracle::new().on_decompose(
        "Tidy notes",
        &plan(&[
            subtask("Sort notes", "sort-notes by topic", "AnalystAgent", "none"),
            subtask("Summarize notes", "summarize-notes briefly", "WriterAgent", "1"),
        ]),
    );
    let orchestrator = Orchestrator::new(
        Config::default(),
        store.clone(),
        Arc::new(oracle),
        queue.clone(),
        DispatchMode::Async,
    );
    let (recorder, seen) = Recorder::new("recorder", false);
    orchestrator
        .bus()
        .register_handler(catalog::SUBTASK_COMPLETED, recorder, 30);
    assert_eq!(
        orchestrator.bus().handler_names(catalog::SUBTASK_COMPLETED),
        vec!["audit", "activity", "recorder", "coordination"]
    );

    let root = orchestrator
        .submit("Tidy notes", "Tidy the meeting notes", Default::default())
        .await
        .unwrap();
    assert!(matches!(
        queue.pending().first().map(|q| q.unit),
        Some(WorkUnit::DispatchEvent { .. })
    ));

    let summary = orchestrator.drain(&queue).await;
    assert_eq!(summary.failed, 0);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert!(store
        .events()
        .await
        .unwrap()
        .iter()
        .all(|e| e.processed_at.is_some()));
    assert_eq!(
        store.get_task(root).await.unwrap().state,
        cadre::core::TaskState::Completed
    );
}
