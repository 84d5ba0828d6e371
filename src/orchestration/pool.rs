//! Agent pool: per-kind concurrency quotas.
//!
//! Each agent kind gets a counting semaphore sized by its quota. Taking a
//! slot is a single `try_acquire`, so two coordinators can never both
//! believe the last slot is free. A slot is held by an activity until
//! [`AgentPool::release`] is called for it.
//!
//! Running out of slots is a deferral, not a failure: the coordinator
//! leaves the subtask `pending` and records itself as waiting on that
//! kind. Releasing a slot hands back the waiting coordinators so their
//! scheduling cycle can be re-run.

use crate::config::QuotaConfig;
use crate::core::{ActivityId, AgentKind, TaskId};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct Slot {
    kind: AgentKind,
    _permit: OwnedSemaphorePermit,
}

/// A slot handed back to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedSlot {
    pub kind: AgentKind,
    /// Coordinator tasks that deferred work for lack of this kind.
    pub waiting: Vec<TaskId>,
}

/// Slot accounting shared by every coordinator.
pub struct AgentPool {
    limits: BTreeMap<AgentKind, usize>,
    semaphores: HashMap<AgentKind, Arc<Semaphore>>,
    /// Held slots by activity.
    slots: Mutex<HashMap<ActivityId, Slot>>,
    /// Coordinators waiting for a slot of each kind, first come first.
    waiting: Mutex<HashMap<AgentKind, Vec<TaskId>>>,
}

impl AgentPool {
    /// Pool sized from the configured per-kind quotas.
    pub fn new(quotas: &QuotaConfig) -> Self {
        Self::with_limits(quotas.resolve())
    }

    /// Pool with explicit limits. A kind missing from `limits` never gets a slot.
    pub fn with_limits(limits: BTreeMap<AgentKind, usize>) -> Self {
        let semaphores = limits
            .iter()
            .map(|(kind, max)| (*kind, Arc::new(Semaphore::new(*max))))
            .collect();
        Self {
            limits,
            semaphores,
            slots: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Quota for `kind`.
    pub fn max_for(&self, kind: AgentKind) -> usize {
        self.limits.get(&kind).copied().unwrap_or(0)
    }

    /// Free slots for `kind`.
    pub fn available(&self, kind: AgentKind) -> usize {
        self.semaphores
            .get(&kind)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }

    /// Slots of `kind` currently held.
    pub fn in_flight(&self, kind: AgentKind) -> usize {
        self.max_for(kind).saturating_sub(self.available(kind))
    }

    pub fn has_capacity(&self, kind: AgentKind) -> bool {
        self.available(kind) > 0
    }

    /// Take a slot of `kind` for `activity`, or fail with `QuotaExceeded`.
    pub fn try_acquire(&self, kind: AgentKind, activity: ActivityId) -> Result<()> {
        let exceeded = || Error::QuotaExceeded {
            agent: kind,
            max: self.max_for(kind),
        };
        let semaphore = self.semaphores.get(&kind).ok_or_else(exceeded)?;
        let permit = semaphore.clone().try_acquire_owned().map_err(|_| exceeded())?;

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(
            activity,
            Slot {
                kind,
                _permit: permit,
            },
        );
        debug!(agent = %kind, activity = %activity.short(), in_flight = self.in_flight(kind), "Slot acquired");
        Ok(())
    }

    /// Whether `activity` currently holds a slot.
    pub fn holds_slot(&self, activity: ActivityId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&activity)
    }

    /// Record that `coordinator` deferred a subtask for lack of `kind`.
    ///
    /// Each coordinator is listed once per kind however many subtasks it
    /// deferred; one wake-up re-runs its whole scheduling cycle. The list
    /// is drained by the next [`AgentPool::release`] of that kind.
    pub fn defer(&self, kind: AgentKind, coordinator: TaskId) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let list = waiting.entry(kind).or_default();
        if !list.contains(&coordinator) {
            list.push(coordinator);
        }
    }

    /// Give back the slot held by `activity`.
    ///
    /// Returns `None` if the activity held no slot (already released, or a
    /// root coordinator that never took one).
    pub fn release(&self, activity: ActivityId) -> Option<ReleasedSlot> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&activity)?;
        let kind = slot.kind;
        drop(slot);

        let waiting = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .unwrap_or_default();
        debug!(agent = %kind, activity = %activity.short(), waiting = waiting.len(), "Slot released");
        Some(ReleasedSlot { kind, waiting })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool(max: usize) -> AgentPool {
        AgentPool::with_limits(AgentKind::ALL.iter().map(|k| (*k, max)).collect())
    }

    #[test]
    fn test_pool_new_uses_quota_config() {
        let mut quotas = QuotaConfig::default();
        quotas.per_agent.insert("WriterAgent".to_string(), 1);
        let pool = AgentPool::new(&quotas);
        assert_eq!(pool.max_for(AgentKind::Writer), 1);
        assert_eq!(pool.max_for(AgentKind::Coder), 4);
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = create_test_pool(2);
        pool.try_acquire(AgentKind::Writer, ActivityId::new()).unwrap();
        pool.try_acquire(AgentKind::Writer, ActivityId::new()).unwrap();
        assert!(!pool.has_capacity(AgentKind::Writer));

        let err = pool
            .try_acquire(AgentKind::Writer, ActivityId::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                agent: AgentKind::Writer,
                max: 2
            }
        ));
        // Other kinds are unaffected.
        assert!(pool.has_capacity(AgentKind::Coder));
    }

    #[test]
    fn test_release_frees_slot() {
        let pool = create_test_pool(1);
        let activity = ActivityId::new();
        pool.try_acquire(AgentKind::Analyst, activity).unwrap();
        assert_eq!(pool.in_flight(AgentKind::Analyst), 1);
        assert!(pool.holds_slot(activity));

        let released = pool.release(activity).unwrap();
        assert_eq!(released.kind, AgentKind::Analyst);
        assert_eq!(pool.in_flight(AgentKind::Analyst), 0);
        assert!(pool.release(activity).is_none());
    }

    #[test]
    fn test_release_returns_waiting_coordinators_once() {
        let pool = create_test_pool(1);
        let activity = ActivityId::new();
        let parent = TaskId::new();
        pool.try_acquire(AgentKind::Coder, activity).unwrap();
        pool.defer(AgentKind::Coder, parent);
        pool.defer(AgentKind::Coder, parent);

        let released = pool.release(activity).unwrap();
        assert_eq!(released.waiting, vec![parent]);

        let again = ActivityId::new();
        pool.try_acquire(AgentKind::Coder, again).unwrap();
        assert!(pool.release(again).unwrap().waiting.is_empty());
    }

    #[test]
    fn test_waiting_list_survives_poisoned_lock() {
        let pool = create_test_pool(1);
        let activity = ActivityId::new();
        let parent = TaskId::new();
        pool.try_acquire(AgentKind::Writer, activity).unwrap();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = pool.waiting.lock().unwrap();
            panic!("waiter died");
        }));
        assert!(poisoned.is_err());

        pool.defer(AgentKind::Writer, parent);
        let released = pool.release(activity).unwrap();
        assert_eq!(released.waiting, vec![parent]);
        assert!(pool.has_capacity(AgentKind::Writer));
    }

    #[test]
    fn test_zero_quota_never_acquires() {
        let pool = create_test_pool(0);
        assert!(pool
            .try_acquire(AgentKind::Reviewer, ActivityId::new())
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_quota() {
        let pool = Arc::new(create_test_pool(3));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.try_acquire(AgentKind::Researcher, ActivityId::new())
                    .is_ok()
            }));
        }
        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 3);
    }
}
