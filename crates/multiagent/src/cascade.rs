//! Delegation cascade control.
//!
//! Every delegated call (an intent with a non-empty instruction chain) is
//! checked for cycles, depth and per-orchestrator concurrency, in that
//! order, before any evaluator sees it. A successful check hands out a
//! [`DelegationPermit`] that holds one concurrency slot until dropped.

use crate::trust::TrustLedger;
use actionguard_config::GlobalConfig;
use actionguard_core::{ActionIntent, AgentCall, CascadeError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Task key used for intents that carry no task id.
pub const UNTRACKED_TASK: &str = "(untracked)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeLimits {
    pub max_depth: usize,
    pub max_concurrent: usize,
}

impl From<&GlobalConfig> for CascadeLimits {
    fn from(global: &GlobalConfig) -> Self {
        Self {
            max_depth: global.max_delegation_depth,
            max_concurrent: global.max_concurrent_delegations,
        }
    }
}

impl Default for CascadeLimits {
    fn default() -> Self {
        Self::from(&GlobalConfig::default())
    }
}

#[derive(Debug)]
struct TaskState {
    epoch: u64,
    seen_agents: HashSet<String>,
    max_depth: usize,
    /// Orchestrator → active delegations.
    active: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct CascadeInner {
    tasks: HashMap<String, TaskState>,
    next_epoch: u64,
}

impl CascadeInner {
    fn task(&mut self, task_id: &str) -> &mut TaskState {
        let next_epoch = &mut self.next_epoch;
        self.tasks.entry(task_id.to_string()).or_insert_with(|| {
            *next_epoch += 1;
            TaskState {
                epoch: *next_epoch,
                seen_agents: HashSet::new(),
                max_depth: 0,
                active: HashMap::new(),
            }
        })
    }
}

/// What a closed task looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeSummary {
    pub task_id: String,
    pub agents_seen: usize,
    pub max_depth: usize,
    /// Delegation slots still held when the task closed.
    pub abandoned_slots: usize,
}

/// Enforces delegation limits per task.
#[derive(Debug)]
pub struct CascadeController {
    limits: CascadeLimits,
    trust: Arc<TrustLedger>,
    inner: Arc<Mutex<CascadeInner>>,
}

impl CascadeController {
    pub fn new(limits: CascadeLimits, trust: Arc<TrustLedger>) -> Self {
        Self {
            limits,
            trust,
            inner: Arc::new(Mutex::new(CascadeInner::default())),
        }
    }

    pub fn limits(&self) -> CascadeLimits {
        self.limits
    }

    /// Check `intent` and, for delegated calls, take a concurrency slot.
    ///
    /// Returns `Ok(None)` for a direct call (empty chain).
    pub fn check(&self, intent: &ActionIntent) -> Result<Option<DelegationPermit>, CascadeError> {
        let chain = &intent.instruction_chain;
        let task_id = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        // Agents are only tallied for real tasks; the shared key never closes.
        let tracked = task_id != UNTRACKED_TASK;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let (Some(root), Some(last)) = (chain.root(), chain.last()) else {
            if tracked {
                inner.task(task_id).seen_agents.insert(intent.agent_id.clone());
            }
            return Ok(None);
        };

        let (orchestrator, active) = self
            .validate(intent, root, last, inner.tasks.get(task_id))
            .map_err(|e| self.reject(task_id, e))?;

        let state = inner.task(task_id);
        *state.active.entry(orchestrator.clone()).or_insert(0) += 1;
        state.max_depth = state.max_depth.max(chain.len());
        if tracked {
            state.seen_agents.insert(intent.agent_id.clone());
            state.seen_agents.extend(chain.agent_ids().into_iter().map(String::from));
        }
        debug!(
            task = %task_id,
            orchestrator = %orchestrator,
            active = active + 1,
            depth = chain.len(),
            "Delegation slot acquired"
        );

        Ok(Some(DelegationPermit {
            inner: Arc::clone(&self.inner),
            task_id: task_id.to_string(),
            orchestrator,
            epoch: state.epoch,
        }))
    }

    /// What [`check`](Self::check) would decide, without taking a slot or
    /// creating task state.
    pub fn preview(&self, intent: &ActionIntent) -> Result<(), CascadeError> {
        let chain = &intent.instruction_chain;
        let (Some(root), Some(last)) = (chain.root(), chain.last()) else {
            return Ok(());
        };
        let task_id = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.validate(intent, root, last, inner.tasks.get(task_id))
            .map(|_| ())
    }

    /// Cycle, depth, concurrency and allowlist, in that order. Returns the
    /// orchestrator and its current active count.
    fn validate(
        &self,
        intent: &ActionIntent,
        root: &AgentCall,
        last: &AgentCall,
        state: Option<&TaskState>,
    ) -> Result<(String, usize), CascadeError> {
        let chain = &intent.instruction_chain;

        if chain.contains_agent(&intent.agent_id) {
            return Err(CascadeError::Cycle {
                agent_id: intent.agent_id.clone(),
            });
        }
        if let Some(dup) = chain.first_duplicate() {
            return Err(CascadeError::Cycle {
                agent_id: dup.to_string(),
            });
        }

        if chain.len() > self.limits.max_depth {
            return Err(CascadeError::DepthExceeded {
                depth: chain.len(),
                max: self.limits.max_depth,
            });
        }

        let orchestrator = root.agent_id.clone();
        let active = state
            .and_then(|s| s.active.get(&orchestrator).copied())
            .unwrap_or(0);
        if active >= self.limits.max_concurrent {
            return Err(CascadeError::ConcurrencyExceeded {
                orchestrator,
                active,
                max: self.limits.max_concurrent,
            });
        }

        if !self.trust.can_delegate(&last.agent_id, &intent.agent_id) {
            return Err(CascadeError::DelegationNotPermitted {
                from: last.agent_id.clone(),
                to: intent.agent_id.clone(),
            });
        }
        Ok((orchestrator, active))
    }

    fn reject(&self, task_id: &str, error: CascadeError) -> CascadeError {
        warn!(task = %task_id, kind = error.kind(), "Cascade violation: {error}");
        error
    }

    /// Active delegations held for `orchestrator` within `task_id`.
    pub fn active_delegations(&self, task_id: &str, orchestrator: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .get(task_id)
            .and_then(|t| t.active.get(orchestrator).copied())
            .unwrap_or(0)
    }

    /// Number of tasks with live cascade state.
    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tasks.len()
    }

    /// Drop all state for `task_id`. Permits still alive from this task
    /// release into nothing.
    pub fn close_task(&self, task_id: &str) -> Option<CascadeSummary> {
        let state = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .remove(task_id)?;
        let summary = CascadeSummary {
            task_id: task_id.to_string(),
            agents_seen: state.seen_agents.len(),
            max_depth: state.max_depth,
            abandoned_slots: state.active.values().sum(),
        };
        info!(
            task = %task_id,
            agents = summary.agents_seen,
            max_depth = summary.max_depth,
            abandoned_slots = summary.abandoned_slots,
            "Cascade state closed"
        );
        Some(summary)
    }
}

/// One held delegation slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
#[must_use = "dropping the permit releases the delegation slot immediately"]
pub struct DelegationPermit {
    inner: Arc<Mutex<CascadeInner>>,
    task_id: String,
    orchestrator: String,
    epoch: u64,
}

impl DelegationPermit {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn orchestrator(&self) -> &str {
        &self.orchestrator
    }

    /// Release now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for DelegationPermit {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner.tasks.get_mut(&self.task_id) else {
            return;
        };
        // A task closed and reopened under the same id has a new epoch.
        if state.epoch != self.epoch {
            return;
        }
        if let Some(count) = state.active.get_mut(&self.orchestrator) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(&self.orchestrator);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionguard_core::{AgentCall, InstructionChain};

    fn ledger() -> Arc<TrustLedger> {
        let ledger = TrustLedger::new();
        for id in ["orch", "a", "b", "c", "d", "e", "worker"] {
            ledger.register(id, 0.8);
        }
        Arc::new(ledger)
    }

    fn controller(max_depth: usize, max_concurrent: usize) -> CascadeController {
        CascadeController::new(
            CascadeLimits {
                max_depth,
                max_concurrent,
            },
            ledger(),
        )
    }

    fn delegated(agent: &str, hops: &[&str]) -> ActionIntent {
        let chain: InstructionChain = hops.iter().map(|h| AgentCall::new(*h, 0.8, "do")).collect();
        ActionIntent::new("file.write", "fs", agent)
            .with_task("t-1")
            .with_chain(chain)
    }

    #[test]
    fn direct_calls_need_no_permit() {
        let c = controller(4, 10);
        let intent = ActionIntent::new("file.read", "fs", "solo").with_task("t-1");
        assert!(c.check(&intent).unwrap().is_none());
    }

    #[test]
    fn direct_calls_without_a_task_leave_no_state() {
        let c = controller(4, 10);
        for i in 0..100 {
            let intent = ActionIntent::new("file.read", "fs", format!("solo-{i}"));
            assert!(c.check(&intent).unwrap().is_none());
        }
        assert_eq!(c.task_count(), 0);
    }

    #[test]
    fn untracked_delegations_do_not_collect_agents() {
        let c = controller(4, 10);
        let chain: InstructionChain = ["orch"].iter().map(|h| AgentCall::new(*h, 0.8, "do")).collect();
        for i in 0..20 {
            let intent = ActionIntent::new("file.write", "fs", format!("w{i}")).with_chain(chain.clone());
            drop(c.check(&intent).unwrap());
        }
        let summary = c.close_task(UNTRACKED_TASK).unwrap();
        assert_eq!(summary.agents_seen, 0);
        assert_eq!(summary.abandoned_slots, 0);
    }

    #[test]
    fn preview_matches_check_without_side_effects() {
        let c = controller(4, 1);
        let intent = delegated("a", &["orch"]);
        assert!(c.preview(&intent).is_ok());
        assert_eq!(c.task_count(), 0);

        let held = c.check(&intent).unwrap();
        assert_eq!(
            c.preview(&delegated("b", &["orch"])).unwrap_err().kind(),
            "concurrency_exceeded"
        );
        assert_eq!(c.preview(&delegated("a", &["orch", "a"])).unwrap_err().kind(), "cycle");
        assert_eq!(c.active_delegations("t-1", "orch"), 1);
        drop(held);
        assert!(c.preview(&delegated("b", &["orch"])).is_ok());
        assert_eq!(c.active_delegations("t-1", "orch"), 0);
    }

    #[test]
    fn caller_in_chain_is_a_cycle() {
        let c = controller(4, 10);
        let err = c.check(&delegated("a", &["orch", "a", "b"])).unwrap_err();
        assert_eq!(err, CascadeError::Cycle { agent_id: "a".into() });
    }

    #[test]
    fn duplicate_within_chain_is_a_cycle() {
        let c = controller(4, 10);
        let err = c.check(&delegated("worker", &["a", "b", "a"])).unwrap_err();
        assert_eq!(err.kind(), "cycle");
    }

    #[test]
    fn cycle_is_checked_before_depth() {
        let c = controller(2, 10);
        let err = c
            .check(&delegated("a", &["orch", "a", "b", "c", "d"]))
            .unwrap_err();
        assert_eq!(err.kind(), "cycle");
    }

    #[test]
    fn depth_limit_is_inclusive() {
        let c = controller(4, 10);
        let ok = c.check(&delegated("worker", &["orch", "a", "b", "c"]));
        assert!(ok.unwrap().is_some());

        let err = c
            .check(&delegated("worker", &["orch", "a", "b", "c", "d"]))
            .unwrap_err();
        assert_eq!(err, CascadeError::DepthExceeded { depth: 5, max: 4 });
    }

    #[test]
    fn concurrency_is_per_orchestrator() {
        let c = controller(4, 2);
        let p1 = c.check(&delegated("a", &["orch"])).unwrap();
        let p2 = c.check(&delegated("b", &["orch"])).unwrap();
        assert_eq!(c.active_delegations("t-1", "orch"), 2);

        let err = c.check(&delegated("c", &["orch"])).unwrap_err();
        assert!(matches!(
            err,
            CascadeError::ConcurrencyExceeded { active: 2, max: 2, .. }
        ));

        // A different orchestrator has its own budget.
        let other = c.check(&delegated("c", &["d"])).unwrap();
        assert!(other.is_some());

        drop(p1);
        assert_eq!(c.active_delegations("t-1", "orch"), 1);
        assert!(c.check(&delegated("c", &["orch"])).unwrap().is_some());
        drop(p2);
    }

    #[test]
    fn permits_release_exactly_once() {
        let c = controller(4, 10);
        let permits: Vec<_> = (0..5)
            .map(|_| c.check(&delegated("worker", &["orch"])).unwrap())
            .collect();
        assert_eq!(c.active_delegations("t-1", "orch"), 5);
        drop(permits);
        assert_eq!(c.active_delegations("t-1", "orch"), 0);
    }

    #[test]
    fn permits_release_on_panic() {
        let c = controller(4, 10);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _permit = c.check(&delegated("worker", &["orch"])).unwrap();
            panic!("action failed");
        }));
        assert!(result.is_err());
        assert_eq!(c.active_delegations("t-1", "orch"), 0);
    }

    #[test]
    fn closed_epoch_permits_release_into_nothing() {
        let c = controller(4, 1);
        let stale = c.check(&delegated("a", &["orch"])).unwrap();
        let summary = c.close_task("t-1").unwrap();
        assert_eq!(summary.abandoned_slots, 1);
        assert_eq!(summary.agents_seen, 2);

        // The reopened task has a fresh slot, and the stale permit must not free it.
        let fresh = c.check(&delegated("b", &["orch"])).unwrap();
        drop(stale);
        assert_eq!(c.active_delegations("t-1", "orch"), 1);
        assert!(c.check(&delegated("c", &["orch"])).is_err());
        drop(fresh);
        assert_eq!(c.active_delegations("t-1", "orch"), 0);
    }

    #[test]
    fn allowlist_is_enforced_on_the_last_hop() {
        let ledger = TrustLedger::new();
        ledger.register_agent(&actionguard_config::AgentConfig {
            id: "orch".into(),
            trust_level: actionguard_config::TrustSpec::Score(0.8),
            can_delegate_to: vec!["writer".into()],
            max_actions_per_run: None,
        });
        let c = CascadeController::new(CascadeLimits::default(), Arc::new(ledger));
        assert!(c.check(&delegated("writer", &["orch"])).is_ok());
        let err = c.check(&delegated("deleter", &["orch"])).unwrap_err();
        assert_eq!(err.kind(), "delegation_not_permitted");
    }

    #[test]
    fn concurrent_checks_never_exceed_the_limit() {
        let c = Arc::new(controller(4, 3));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    c.check(&delegated(&format!("w{i}"), &["orch"])).ok().flatten()
                })
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(c.active_delegations("t-1", "orch"), 3);
    }
}
