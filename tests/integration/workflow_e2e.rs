//! End-to-end workflow tests: submission through synthesis.

use cadre::core::{AgentKind, TaskState};
use cadre::events::catalog;
use cadre::oracle::{Reply, ScriptedOracle};
use cadre::orchestration::WorkUnit;
use cadre::store::Store;

use crate::fixtures::{plan, subtask, Harness};

fn report_plan() -> String {
    plan(&[
        subtask("Collect sources", "collect-sources for the report", "ResearcherAgent", "none"),
        subtask("Gather statistics", "gather-statistics for the report", "AnalystAgent", "none"),
        subtask("Write the report", "write-report from the findings", "WriterAgent", "1, 2"),
    ])
}

fn report_oracle() -> ScriptedOracle {
    ScriptedOracle::new()
        .on_decompose("Write a report", &report_plan())
        .on_execute("collect-sources", Reply::text("three sources"))
        .on_execute("gather-statistics", Reply::text("growth was 4%"))
        .on_execute("write-report", Reply::text("the report"))
        .on_synthesize("final report")
}

/// Test: Dependent subtask waits for both inputs
/// Given a plan A, B, C where C depends on A and B
/// When the first scheduling cycle runs
/// Then A and B are assigned and C is assigned only after both complete
#[tokio::test]
async fn test_diamond_dependencies_gate_assignment() {
    let h = Harness::new(report_oracle());
    let root = h.submit("Write a report", "Quarterly report on growth").await;

    assert!(matches!(h.step().await, WorkUnit::RunCoordinator { .. }));
    let a = h.child(root, "Collect sources").await;
    let b = h.child(root, "Gather statistics").await;
    let c = h.child(root, "Write the report").await;
    assert_eq!(c.depends_on_task_ids, vec![a.id, b.id]);
    assert_eq!(a.state, TaskState::Active);
    assert_eq!(b.state, TaskState::Active);
    assert_eq!(c.state, TaskState::Pending);

    // A finishes first; C still waits on B.
    assert!(matches!(h.step().await, WorkUnit::RunWorker { task_id, .. } if task_id == a.id));
    assert_eq!(h.task(c.id).await.state, TaskState::Pending);

    h.step().await; // B
    assert_eq!(h.task(b.id).await.state, TaskState::Completed);
    assert_eq!(h.step().await, WorkUnit::CoordinationCycle { task_id: root });
    assert_eq!(h.task(c.id).await.state, TaskState::Active);

    let summary = h.drain().await;
    assert_eq!(summary.failed, 0);

    let done = h.task(root).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.result.as_deref(), Some("final report"));
    assert_eq!(h.oracle.call_count("synthesize"), 1);
}

/// Test: Results flow downstream
/// Given completed research and statistics subtasks
/// When the writer runs
/// Then its prompt carries both upstream results
#[tokio::test]
async fn test_writer_sees_upstream_results() {
    let h = Harness::new(report_oracle());
    let root = h.submit("Write a report", "Quarterly report on growth").await;
    h.drain().await;

    let writer = h.child(root, "Write the report").await;
    assert_eq!(writer.metadata.assigned_agent, Some(AgentKind::Writer));
    assert_eq!(writer.result.as_deref(), Some("the report"));

    let prompt = h
        .oracle
        .calls()
        .into_iter()
        .map(|r| r.prompt)
        .find(|p| p.contains("write-report"))
        .expect("writer prompt");
    assert!(prompt.contains("three sources"));
    assert!(prompt.contains("growth was 4%"));
}

/// Test: Event trail
/// Given a completed project
/// Then every event is stored, processed, and tagged with the project
#[tokio::test]
async fn test_event_trail_for_completed_project() {
    let h = Harness::new(report_oracle());
    let root = h.submit("Write a report", "Quarterly report on growth").await;
    h.drain().await;

    let types = h.event_types().await;
    assert_eq!(types.first().map(String::as_str), Some(catalog::TASK_CREATED));
    assert_eq!(types.last().map(String::as_str), Some(catalog::TASK_COMPLETED));
    for expected in [
        catalog::TASK_ACTIVATED,
        catalog::TASK_DECOMPOSED,
        catalog::SUBTASK_CREATED,
        catalog::SUBTASK_ASSIGNED,
        catalog::SUBTASK_COMPLETED,
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {}", expected);
    }
    assert_eq!(
        types.iter().filter(|t| *t == catalog::SUBTASK_COMPLETED).count(),
        3
    );

    let events = h.store.events().await.unwrap();
    assert!(events.iter().all(|e| e.processed_at.is_some()));
    assert!(events.iter().all(|e| e.metadata.project_id == Some(root)));
}

/// Test: Activities and slots are released
/// Given a completed project
/// Then every activity is finished and no pool slot is held
#[tokio::test]
async fn test_activities_closed_after_completion() {
    let h = Harness::new(report_oracle());
    let root = h.submit("Write a report", "Quarterly report on growth").await;
    h.drain().await;

    for child in h.children(root).await {
        let activity_id = child.metadata.activity_id.expect("assigned");
        let activity = h.store.get_activity(activity_id).await.unwrap();
        assert!(!activity.is_running());
        assert!(activity.output_tokens > 0);
        assert!(!h.orchestrator.pool().holds_slot(activity_id));
    }
    let root_activity = h.task(root).await.metadata.activity_id.unwrap();
    assert!(!h.store.get_activity(root_activity).await.unwrap().is_running());
}

/// Test: Unparseable decomposition
/// Given an oracle that returns prose with no subtasks
/// When the coordinator runs
/// Then the root waits on a required human request
#[tokio::test]
async fn test_unparseable_plan_escalates() {
    let oracle = ScriptedOracle::new().on_decompose("Vague goal", "I am not sure how to split this.");
    let h = Harness::new(oracle);
    let root = h.submit("Vague goal", "Do the thing").await;
    h.drain().await;

    assert_eq!(h.task(root).await.state, TaskState::WaitingOnHuman);
    let pending = h.pending_interactions().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].required);
    assert!(pending[0].question.contains("Decomposition failed"));
}

/// Test: One-step plan
/// Given a decomposition with a single record and no separator
/// When the project drains
/// Then the lone subtask runs and the root completes
#[tokio::test]
async fn test_single_subtask_plan_completes() {
    let oracle = ScriptedOracle::new()
        .on_decompose(
            "Short note",
            &plan(&[subtask("Only step", "only-step for the note", "WriterAgent", "none")]),
        )
        .on_execute("only-step", Reply::text("the note"));
    let h = Harness::new(oracle);
    let root = h.submit("Short note", "A two line note").await;
    h.drain().await;

    let children = h.children(root).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].state, TaskState::Completed);
    assert_eq!(children[0].metadata.suggested_agent, Some(AgentKind::Writer));
    assert!(h.pending_interactions().await.is_empty());
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}
