//! Scheduling tests: batch cap, ordering and quota deferral.

use cadre::config::{Config, QuotaConfig};
use cadre::core::{AgentKind, TaskState};
use cadre::events::catalog;
use cadre::oracle::ScriptedOracle;
use cadre::orchestration::{Assignment, WorkUnit, ASSIGNMENT_BATCH_CAP};

use crate::fixtures::{plan, subtask, Harness};

fn block(title: &str, priority: &str, agent: &str, complexity: &str) -> String {
    format!(
        "Title: {}\nDescription: {} work\nPriority: {}\nAgent: {}\nDependencies: none\nComplexity: {}\n",
        title,
        title.to_lowercase(),
        priority,
        agent,
        complexity
    )
}

fn single_quota(agent: &str) -> Config {
    let mut config = Config::default();
    config.quotas = QuotaConfig {
        per_agent: [(agent.to_string(), 1)].into_iter().collect(),
        ..QuotaConfig::default()
    };
    config
}

fn worker_units(units: &[WorkUnit]) -> Vec<cadre::core::TaskId> {
    units
        .iter()
        .filter_map(|u| match u {
            WorkUnit::RunWorker { task_id, .. } => Some(*task_id),
            _ => None,
        })
        .collect()
}

/// Test: Batch cap
/// Given five independent eligible subtasks
/// When the first cycle runs
/// Then three are assigned and the other two wait for the next cycle
#[tokio::test]
async fn test_cycle_assigns_at_most_three() {
    let oracle = ScriptedOracle::new().on_decompose(
        "Five things",
        &plan(&[
            subtask("One", "first piece", "ResearcherAgent", "none"),
            subtask("Two", "second piece", "AnalystAgent", "none"),
            subtask("Three", "third piece", "WriterAgent", "none"),
            subtask("Four", "fourth piece", "CoderAgent", "none"),
            subtask("Five", "fifth piece", "ReviewerAgent", "none"),
        ]),
    );
    let h = Harness::new(oracle);
    let root = h.submit("Five things", "Do five things").await;
    h.step().await;

    let children = h.children(root).await;
    let active = children.iter().filter(|c| c.state == TaskState::Active).count();
    assert_eq!(active, ASSIGNMENT_BATCH_CAP);
    assert_eq!(worker_units(&h.queued()).len(), ASSIGNMENT_BATCH_CAP);
    assert_eq!(h.child(root, "Four").await.state, TaskState::Pending);
    assert_eq!(h.child(root, "Five").await.state, TaskState::Pending);

    // The first completion triggers the next cycle.
    h.step().await;
    h.step().await;
    h.step().await;
    assert_eq!(h.step().await, WorkUnit::CoordinationCycle { task_id: root });
    assert_eq!(h.child(root, "Four").await.state, TaskState::Active);
    assert_eq!(h.child(root, "Five").await.state, TaskState::Active);

    h.drain().await;
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: Priority, then complexity
/// Given subtasks of mixed priority and complexity
/// When the first cycle runs
/// Then high priority goes first, simpler work breaks the tie, and low waits
#[tokio::test]
async fn test_priority_then_complexity_order() {
    let oracle = ScriptedOracle::new().on_decompose(
        "Mixed",
        &plan(&[
            block("Low simple", "low", "ResearcherAgent", "simple"),
            block("High moderate", "high", "AnalystAgent", "moderate"),
            block("Normal simple", "normal", "WriterAgent", "simple"),
            block("High simple", "high", "CoderAgent", "simple"),
        ]),
    );
    let h = Harness::new(oracle);
    let root = h.submit("Mixed", "Mixed priorities").await;
    h.step().await;

    let expected = vec![
        h.child(root, "High simple").await.id,
        h.child(root, "High moderate").await.id,
        h.child(root, "Normal simple").await.id,
    ];
    assert_eq!(worker_units(&h.queued()), expected);
    assert_eq!(h.child(root, "Low simple").await.state, TaskState::Pending);
}

/// Test: Quota deferral
/// Given a Writer quota of one and two independent writing subtasks
/// When the first cycle runs
/// Then the second is deferred and assigned once the first frees the slot
#[tokio::test]
async fn test_quota_deferral_resumes_on_release() {
    let oracle = ScriptedOracle::new().on_decompose(
        "Two drafts",
        &plan(&[
            subtask("Intro", "draft the intro", "WriterAgent", "none"),
            subtask("Outro", "draft the outro", "WriterAgent", "none"),
        ]),
    );
    let h = Harness::with_config(oracle, single_quota("WriterAgent"));
    let root = h.submit("Two drafts", "Write both").await;
    h.step().await;

    assert_eq!(h.child(root, "Intro").await.state, TaskState::Active);
    assert_eq!(h.child(root, "Outro").await.state, TaskState::Pending);
    assert!(h
        .event_types()
        .await
        .iter()
        .any(|t| t == catalog::SUBTASK_DEFERRED));
    assert_eq!(worker_units(&h.queued()).len(), 1);

    // Intro completes: the freed slot and the completion both wake the root.
    h.step().await;
    assert_eq!(
        h.queued(),
        vec![
            WorkUnit::CoordinationCycle { task_id: root },
            WorkUnit::CoordinationCycle { task_id: root },
        ]
    );
    h.step().await;
    assert_eq!(h.child(root, "Outro").await.state, TaskState::Active);

    let summary = h.drain().await;
    assert_eq!(summary.failed, 0);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: Nested coordinators under a coordinator quota of one
/// Given a sub-coordinator whose own plan contains another sub-coordinator
/// When only one coordinator slot exists
/// Then the inner coordinator still runs and the whole tree completes
#[tokio::test]
async fn test_nested_coordinators_share_one_slot() {
    let oracle = ScriptedOracle::new()
        .on_decompose(
            "Nested plan",
            &plan(&[
                block("Big", "normal", "CoordinatorAgent", "complex"),
                subtask("Note", "jot a note", "WriterAgent", "none"),
            ]),
        )
        .on_decompose(
            "big work",
            &plan(&[
                block("Inner", "normal", "CoordinatorAgent", "complex"),
                subtask("Memo", "write a memo", "WriterAgent", "none"),
            ]),
        )
        .on_decompose(
            "inner work",
            &plan(&[subtask("Leaf", "finish the leaf", "CoderAgent", "none")]),
        );
    let h = Harness::with_config(oracle, single_quota("CoordinatorAgent"));
    let root = h.submit("Nested plan", "Two levels of coordination").await;

    let summary = h.drain().await;
    assert_eq!(summary.failed, 0);
    assert!(h.pending_interactions().await.is_empty());

    let big = h.child(root, "Big").await;
    let inner = h.child(big.id, "Inner").await;
    assert_eq!(inner.metadata.nesting_level, 2);
    assert_eq!(inner.state, TaskState::Completed);
    assert_eq!(h.child(inner.id, "Leaf").await.state, TaskState::Completed);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
    assert_eq!(h.orchestrator.pool().in_flight(AgentKind::Coordinator), 0);
}

/// Test: Racing assignments of one subtask
/// Given a subtask that just became eligible
/// When two assignments of it run at once
/// Then exactly one wins, its activity stays recorded, and its slot is freed on completion
#[tokio::test]
async fn test_concurrent_assign_keeps_winner() {
    let oracle = ScriptedOracle::new().on_decompose(
        "Two steps",
        &plan(&[
            subtask("First", "first step", "ResearcherAgent", "none"),
            subtask("Second", "second step", "WriterAgent", "1"),
        ]),
    );
    let h = Harness::new(oracle);
    let root = h.submit("Two steps", "One after the other").await;
    h.step().await; // decompose, assign First
    h.step().await; // First completes
    let second = h.child(root, "Second").await;
    assert_eq!(second.state, TaskState::Pending);

    let parent = h.task(root).await;
    let coordinator = h.orchestrator.coordinator();
    let (a, b) = tokio::join!(
        coordinator.assign(&parent, second.id),
        coordinator.assign(&parent, second.id)
    );
    let outcomes = [a, b];
    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            Ok(Assignment::Assigned(activity)) => Some(*activity),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);

    let assigned = h.task(second.id).await;
    assert_eq!(assigned.state, TaskState::Active);
    assert_eq!(assigned.metadata.activity_id, Some(winners[0]));
    assert_eq!(h.orchestrator.pool().in_flight(AgentKind::Writer), 1);

    let summary = h.drain().await;
    assert_eq!(summary.failed, 0);
    assert_eq!(h.task(second.id).await.state, TaskState::Completed);
    assert_eq!(h.orchestrator.pool().in_flight(AgentKind::Writer), 0);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}
