//! Dependency-aware scheduling of a coordinator's subtasks.
//!
//! The `Scheduler` answers two questions for one coordinator task: which
//! of its direct children can start now, and in what order. Eligibility is
//! always computed from a fresh read of the store; the ordering helpers
//! are pure.

use crate::core::{Task, TaskId, TaskState};
use crate::error::Result;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Maximum subtasks assigned in one scheduling cycle.
pub const ASSIGNMENT_BATCH_CAP: usize = 3;

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Pending, live children of `task_id` whose dependencies are all completed.
    ///
    /// Returned in insertion order.
    pub async fn find_eligible_subtasks(&self, task_id: TaskId) -> Result<Vec<Task>> {
        let children = self.store.children_of(task_id).await?;

        let mut states: HashMap<TaskId, TaskState> =
            children.iter().map(|c| (c.id, c.state)).collect();
        for child in &children {
            for dep in &child.depends_on_task_ids {
                if !states.contains_key(dep) {
                    if let Ok(task) = self.store.get_task(*dep).await {
                        states.insert(task.id, task.state);
                    }
                }
            }
        }

        let eligible: Vec<Task> = children
            .into_iter()
            .filter(|c| c.state == TaskState::Pending && !c.is_retired())
            .filter(|c| c.dependencies_satisfied(|id| states.get(id).copied()))
            .collect();
        trace!(task = %task_id.short(), eligible = eligible.len(), "find_eligible_subtasks");
        Ok(eligible)
    }
}

/// Sort by priority, oldest first within a priority.
///
/// The sort is stable, so equal timestamps keep insertion order.
pub fn sort_by_priority(mut eligible: Vec<Task>) -> Vec<Task> {
    eligible.sort_by_key(|t| (t.priority.rank(), t.created_at));
    eligible
}

/// The single next subtask to run.
pub fn select_next(eligible: &[Task]) -> Option<&Task> {
    eligible
        .iter()
        .enumerate()
        .min_by_key(|(index, t)| (t.priority.rank(), t.created_at, *index))
        .map(|(_, t)| t)
}

/// Batch order: priority, then simpler work first, then oldest.
pub fn sort_by_priority_and_complexity(mut eligible: Vec<Task>) -> Vec<Task> {
    eligible.sort_by_key(|t| (t.priority.rank(), t.complexity().rank(), t.created_at));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Complexity, Priority};
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    fn create_test_scheduler() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Scheduler::new(store.clone()), store)
    }

    fn test_task(name: &str) -> Task {
        Task::new(name, &format!("{} description", name))
    }

    async fn set_state(store: &MemoryStore, id: TaskId, path: &[TaskState]) {
        let mut current = TaskState::Pending;
        for next in path {
            store.compare_and_set_state(id, current, *next).await.unwrap();
            current = *next;
        }
    }

    // ========== Eligibility tests ==========

    #[tokio::test]
    async fn test_find_eligible_independent() {
        let (scheduler, store) = create_test_scheduler();
        let parent = test_task("parent");
        let a = Task::child_of(&parent, "a", "a");
        let b = Task::child_of(&parent, "b", "b");
        let (a_id, b_id) = (a.id, b.id);
        for t in [parent.clone(), a, b] {
            store.insert_task(t).await.unwrap();
        }

        let eligible = scheduler.find_eligible_subtasks(parent.id).await.unwrap();
        assert_eq!(
            eligible.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a_id, b_id]
        );
    }

    #[tokio::test]
    async fn test_find_eligible_respects_dependencies() {
        let (scheduler, store) = create_test_scheduler();
        let parent = test_task("parent");
        let a = Task::child_of(&parent, "a", "a");
        let c = Task::child_of(&parent, "c", "c").with_dependencies(vec![a.id]);
        let (a_id, c_id) = (a.id, c.id);
        for t in [parent.clone(), a, c] {
            store.insert_task(t).await.unwrap();
        }

        let eligible = scheduler.find_eligible_subtasks(parent.id).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, a_id);

        set_state(&store, a_id, &[TaskState::Active]).await;
        assert!(scheduler
            .find_eligible_subtasks(parent.id)
            .await
            .unwrap()
            .is_empty());

        store
            .compare_and_set_state(a_id, TaskState::Active, TaskState::Completed)
            .await
            .unwrap();
        let eligible = scheduler.find_eligible_subtasks(parent.id).await.unwrap();
        assert_eq!(eligible[0].id, c_id);
    }

    #[tokio::test]
    async fn test_find_eligible_skips_retired_and_foreign() {
        let (scheduler, store) = create_test_scheduler();
        let parent = test_task("parent");
        let other = test_task("other");
        let live = Task::child_of(&parent, "live", "l");
        let foreign = Task::child_of(&other, "foreign", "f");
        let mut retired = Task::child_of(&parent, "retired", "r");
        retired.metadata.superseded_by = Some(live.id);
        retired.apply_state(TaskState::Failed);
        let live_id = live.id;
        for t in [parent.clone(), other, live, foreign, retired] {
            store.insert_task(t).await.unwrap();
        }

        let eligible = scheduler.find_eligible_subtasks(parent.id).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, live_id);
    }

    // ========== Ordering tests ==========

    #[test]
    fn test_select_next_prefers_priority() {
        let low = test_task("low").with_priority(Priority::Low);
        let high = test_task("high").with_priority(Priority::High);
        let tasks = vec![low, high.clone()];
        assert_eq!(select_next(&tasks).unwrap().id, high.id);
    }

    #[test]
    fn test_select_next_oldest_first_on_tie() {
        let mut old = test_task("old");
        old.created_at = Utc::now() - Duration::minutes(5);
        let new = test_task("new");
        let tasks = vec![new, old.clone()];
        assert_eq!(select_next(&tasks).unwrap().id, old.id);
    }

    #[test]
    fn test_select_next_exact_tie_keeps_first() {
        let a = test_task("a");
        let mut b = test_task("b");
        b.created_at = a.created_at;
        let tasks = vec![a.clone(), b];
        assert_eq!(select_next(&tasks).unwrap().id, a.id);
        assert!(select_next(&[]).is_none());
    }

    #[test]
    fn test_sort_by_priority() {
        let n = test_task("n");
        let h = test_task("h").with_priority(Priority::High);
        let l = test_task("l").with_priority(Priority::Low);
        let sorted = sort_by_priority(vec![n.clone(), l.clone(), h.clone()]);
        assert_eq!(
            sorted.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![h.id, n.id, l.id]
        );
    }

    #[test]
    fn test_complexity_breaks_priority_tie() {
        let complex = test_task("complex").with_complexity(Complexity::Complex);
        let simple = test_task("simple").with_complexity(Complexity::Simple);
        let sorted = sort_by_priority_and_complexity(vec![complex.clone(), simple.clone()]);
        assert_eq!(sorted[0].id, simple.id);
    }

    #[test]
    fn test_priority_beats_complexity() {
        let easy_low = test_task("easy")
            .with_priority(Priority::Low)
            .with_complexity(Complexity::Simple);
        let hard_high = test_task("hard")
            .with_priority(Priority::High)
            .with_complexity(Complexity::Complex);
        let sorted = sort_by_priority_and_complexity(vec![easy_low, hard_high.clone()]);
        assert_eq!(sorted[0].id, hard_high.id);
    }
}
