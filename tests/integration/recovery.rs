//! Failure recovery and human escalation tests.
//!
//! Every scenario decomposes "Load dashboard" into a fetch step that
//! fails at first and a chart step that depends on it.

use chrono::{Duration, Utc};

use cadre::config::Config;
use cadre::core::{AgentKind, InteractionStatus, RecoveryAction, Task, TaskState};
use cadre::events::catalog;
use cadre::oracle::{Reply, ScriptedOracle};
use cadre::store::Store;
use cadre::Error;

use crate::fixtures::{plan, subtask, Harness};

fn dashboard_oracle(analysis: &str) -> ScriptedOracle {
    let oracle = ScriptedOracle::new()
        .on_decompose(
            "Load dashboard",
            &plan(&[
                subtask("Fetch data", "fetch-data-step from the API", "ResearcherAgent", "none"),
                subtask("Chart data", "chart-data-step as a bar chart", "AnalystAgent", "1"),
            ]),
        )
        .on_analyze("Fetch data", analysis);
    oracle.script(
        "execute",
        Some("fetch-data-step"),
        vec![Reply::fail("connection reset"), Reply::text("rows")],
    );
    oracle
}

/// Test: RETRY
/// Given a transient fetch failure and an oracle that answers RETRY
/// When the project runs
/// Then the same subtask runs again and the project completes
#[tokio::test]
async fn test_retry_reruns_same_subtask() {
    let h = Harness::new(dashboard_oracle("ACTION: RETRY\nLooks transient."));
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let fetch = h.child(root, "Fetch data").await;
    assert_eq!(fetch.state, TaskState::Completed);
    assert_eq!(fetch.result.as_deref(), Some("rows"));
    assert_eq!(fetch.metadata.retry_count, 1);
    assert_eq!(fetch.metadata.recovery, None);
    assert_eq!(h.children(root).await.len(), 2);
    assert_eq!(h.oracle.call_count("analyze_failure"), 1);
    assert!(h
        .event_types()
        .await
        .iter()
        .any(|t| t == catalog::RECOVERY_DECIDED));
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: RETRY budget
/// Given a fetch that always fails and an oracle that always answers RETRY
/// When the retries are spent
/// Then the failure is escalated to a human instead
#[tokio::test]
async fn test_retry_budget_escalates() {
    let oracle = ScriptedOracle::new()
        .on_decompose(
            "Load dashboard",
            &plan(&[subtask("Fetch data", "fetch-data-step", "ResearcherAgent", "none")]),
        )
        .on_analyze("Fetch data", "ACTION: RETRY")
        .on_execute("fetch-data-step", Reply::fail("still down"));
    let h = Harness::new(oracle);
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let fetch = h.child(root, "Fetch data").await;
    assert_eq!(fetch.state, TaskState::Failed);
    assert_eq!(fetch.metadata.retry_count, 2);
    assert_eq!(fetch.metadata.recovery, Some(RecoveryAction::Human));
    assert_eq!(h.oracle.call_count("analyze_failure"), 3);

    assert_eq!(h.task(root).await.state, TaskState::WaitingOnHuman);
    let pending = h.pending_interactions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].subtask_id, Some(fetch.id));
}

/// Test: SKIP
/// Given an oracle that answers SKIP
/// Then the failed subtask completes as skipped and dependents proceed
#[tokio::test]
async fn test_skip_completes_and_unblocks_dependents() {
    let h = Harness::new(dashboard_oracle("ACTION: SKIP\nNot critical."));
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let fetch = h.child(root, "Fetch data").await;
    assert_eq!(fetch.state, TaskState::Completed);
    assert!(fetch
        .result
        .as_deref()
        .unwrap()
        .starts_with("Skipped as non-critical"));
    assert_eq!(h.child(root, "Chart data").await.state, TaskState::Completed);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: REDEFINE
/// Given an oracle that answers REDEFINE
/// Then a replacement sibling is created, dependents are rewired to it,
/// and the original is retired
#[tokio::test]
async fn test_redefine_replaces_and_rewires() {
    let h = Harness::new(dashboard_oracle("ACTION: REDEFINE\nAsk for a smaller page."));
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let children = h.children(root).await;
    assert_eq!(children.len(), 3);
    let original = children
        .iter()
        .find(|t| t.title == "Fetch data" && t.is_retired())
        .expect("retired original");
    let replacement = h.child(root, "Fetch data").await;
    assert_eq!(original.metadata.superseded_by, Some(replacement.id));
    assert!(replacement.description.contains("A previous attempt failed"));
    assert_eq!(replacement.state, TaskState::Completed);

    let chart = h.child(root, "Chart data").await;
    assert_eq!(chart.depends_on_task_ids, vec![replacement.id]);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: SPLIT
/// Given an oracle that answers SPLIT
/// Then the replacement is a nested coordinator that decomposes and finishes
#[tokio::test]
async fn test_split_runs_nested_coordinator() {
    let oracle = dashboard_oracle("ACTION: SPLIT\nToo much in one call.").on_decompose(
        "A previous attempt failed",
        &plan(&[
            subtask("Fetch first half", "part-one of the rows", "ResearcherAgent", "none"),
            subtask("Fetch second half", "part-two of the rows", "ResearcherAgent", "none"),
        ]),
    );
    let h = Harness::new(oracle);
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    let summary = h.drain().await;
    assert_eq!(summary.failed, 0);

    let replacement = h.child(root, "Fetch data").await;
    assert_eq!(replacement.metadata.assigned_agent, Some(AgentKind::Coordinator));
    assert_eq!(replacement.state, TaskState::Completed);
    let grandchildren = h.children(replacement.id).await;
    assert_eq!(grandchildren.len(), 2);
    assert!(grandchildren.iter().all(|t| t.metadata.nesting_level == 2));
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: Unclear analysis goes to a human
/// Given an analysis with no ACTION line
/// When the human answers with free-text guidance
/// Then the subtask is redefined with that guidance and the project completes
#[tokio::test]
async fn test_human_guidance_redefines() {
    let h = Harness::new(dashboard_oracle("The API might be down, hard to say."));
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    assert_eq!(h.task(root).await.state, TaskState::WaitingOnHuman);
    let pending = h.pending_interactions().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].required);
    let failed_id = h.child(root, "Fetch data").await.id;
    assert_eq!(pending[0].subtask_id, Some(failed_id));

    let answered = h
        .orchestrator
        .answer(pending[0].id, "Use the cached export instead")
        .await
        .unwrap();
    assert_eq!(answered.status, InteractionStatus::Answered);
    assert_eq!(h.task(root).await.state, TaskState::Active);

    h.drain().await;
    let original = h.task(failed_id).await;
    assert_eq!(original.metadata.recovery, Some(RecoveryAction::Redefine));
    let replacement = h.task(original.metadata.superseded_by.unwrap()).await;
    assert!(replacement
        .description
        .contains("Guidance: Use the cached export instead"));
    assert_eq!(h.task(root).await.state, TaskState::Completed);

    let again = h.orchestrator.answer(pending[0].id, "twice").await;
    assert!(matches!(again, Err(Error::InteractionNotPending(_))));
}

/// Test: Human chooses SKIP explicitly
#[tokio::test]
async fn test_human_action_token_is_applied() {
    let h = Harness::new(dashboard_oracle("No idea."));
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let pending = h.pending_interactions().await;
    h.orchestrator
        .answer(pending[0].id, "ACTION: SKIP")
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.children(root).await.len(), 2);
    let fetch = h.child(root, "Fetch data").await;
    assert_eq!(fetch.metadata.recovery, Some(RecoveryAction::Skip));
    assert_eq!(fetch.state, TaskState::Completed);
    assert_eq!(h.task(root).await.state, TaskState::Completed);
}

/// Test: Expiry
/// Given a human timeout of one minute and an unanswered required request
/// When interactions are expired five minutes later
/// Then the request is ignored and the blocked task fails
#[tokio::test]
async fn test_expired_required_request_fails_task() {
    let mut config = Config::default();
    config.human.timeout_secs = Some(60);
    let h = Harness::with_config(dashboard_oracle("Unclear."), config);
    let root = h.submit("Load dashboard", "Build the sales dashboard").await;
    h.drain().await;

    let pending = h.pending_interactions().await;
    assert_eq!(pending.len(), 1);
    assert!(matches!(
        h.orchestrator.ignore(pending[0].id).await,
        Err(Error::InteractionRequired(_))
    ));

    assert!(h
        .orchestrator
        .expire_interactions(Utc::now())
        .await
        .unwrap()
        .is_empty());
    let expired = h
        .orchestrator
        .expire_interactions(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(expired, vec![pending[0].id]);

    let interaction = h.store.get_interaction(pending[0].id).await.unwrap();
    assert_eq!(interaction.status, InteractionStatus::Ignored);
    let root_task = h.task(root).await;
    assert_eq!(root_task.state, TaskState::Failed);
    assert_eq!(
        root_task.metadata.failure_reason.as_deref(),
        Some("human input timed out")
    );
}

/// Test: Recovery that cannot be applied
/// Given a failed subtask whose siblings already form a dependency cycle
/// When the oracle answers REDEFINE
/// Then no replacement is created and the failure goes to a human instead
#[tokio::test]
async fn test_unapplicable_redefine_falls_back_to_human() {
    let h = Harness::new(ScriptedOracle::new().on_analyze("Stuck step", "ACTION: REDEFINE"));

    let mut parent = Task::new("Tangled", "A plan with a cycle");
    parent.state = TaskState::Active;
    let mut stuck = Task::child_of(&parent, "Stuck step", "never finishes").with_agent(AgentKind::Coder);
    let waiting = Task::child_of(&parent, "Waiting step", "needs the stuck step")
        .with_agent(AgentKind::Writer)
        .with_dependencies(vec![stuck.id]);
    stuck.set_dependencies(vec![waiting.id]);
    stuck.state = TaskState::Failed;
    stuck.metadata.failure_reason = Some("compiler crashed".to_string());
    for task in [parent.clone(), stuck.clone(), waiting.clone()] {
        h.store.insert_task(task).await.unwrap();
    }

    let action = h
        .orchestrator
        .coordinator()
        .recovery()
        .handle_failure(parent.id, stuck.id)
        .await
        .unwrap();
    assert_eq!(action, RecoveryAction::Human);

    let after = h.task(stuck.id).await;
    assert_eq!(after.metadata.recovery, Some(RecoveryAction::Human));
    assert_eq!(after.metadata.superseded_by, None);
    assert_eq!(h.children(parent.id).await.len(), 2);
    assert_eq!(h.task(parent.id).await.state, TaskState::WaitingOnHuman);

    let pending = h.pending_interactions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].subtask_id, Some(stuck.id));
    assert!(pending[0].question.contains("REDEFINE could not be applied"));
}
