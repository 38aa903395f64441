//! Global budget manager — task-wide spend across every agent.
//!
//! Per-agent limits alone are easy to sidestep by fanning a task out to
//! many cheap agents. The manager tracks the task total next to each
//! agent's share and flags spreads that look like that pattern.

use crate::cascade::UNTRACKED_TASK;
use actionguard_config::BudgetConfig;
use actionguard_core::{BudgetError, Verdict};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a budget check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetStatus {
    Ok {
        projected_task: f64,
        projected_agent: f64,
    },
    Exceeded {
        verdict: Verdict,
        error: BudgetError,
    },
    /// Spend spread thinly across many agents while the task total
    /// closes in on its limit.
    Gaming {
        verdict: Verdict,
        agents: usize,
        mean_spend: f64,
        projected_task: f64,
    },
}

impl BudgetStatus {
    pub fn verdict(&self) -> Verdict {
        match self {
            BudgetStatus::Ok { .. } => Verdict::Allow,
            BudgetStatus::Exceeded { verdict, .. } | BudgetStatus::Gaming { verdict, .. } => *verdict,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BudgetStatus::Ok { .. })
    }
}

/// Final numbers for a closed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskBudgetSummary {
    pub task_id: String,
    pub spent: f64,
    pub currency: String,
    pub agent_spend: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct TaskLedger {
    spent: f64,
    per_agent: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct BudgetInner {
    tasks: HashMap<String, TaskLedger>,
    /// Spend by agents acting outside any task. No task total exists for it.
    untracked: HashMap<String, f64>,
}

/// Thread-safe task budget tracking.
///
/// Each operation is atomic under one mutex. A check followed by a later
/// [`add_cost`](Self::add_cost) is not a reservation: two intents checked
/// concurrently can both pass the projection and both accrue.
#[derive(Debug)]
pub struct GlobalBudgetManager {
    config: BudgetConfig,
    inner: Mutex<BudgetInner>,
}

impl GlobalBudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BudgetInner::default()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Record spend. Returns the new task total, or the agent's running
    /// total for spend outside any task.
    pub fn add_cost(&self, task_id: &str, agent_id: &str, amount: f64) -> Result<f64, BudgetError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let mut inner = self.lock();
        if task_id == UNTRACKED_TASK {
            let spent = inner.untracked.entry(agent_id.to_string()).or_insert(0.0);
            *spent += amount;
            debug!(agent = %agent_id, amount, spent = *spent, "Untracked cost recorded");
            return Ok(*spent);
        }
        let ledger = inner.tasks.entry(task_id.to_string()).or_default();
        ledger.spent += amount;
        *ledger.per_agent.entry(agent_id.to_string()).or_insert(0.0) += amount;
        debug!(
            task = %task_id,
            agent = %agent_id,
            amount,
            spent = ledger.spent,
            "Cost recorded"
        );
        Ok(ledger.spent)
    }

    /// Running task total. 0 for unknown tasks.
    pub fn get_spent(&self, task_id: &str) -> f64 {
        self.lock().tasks.get(task_id).map_or(0.0, |l| l.spent)
    }

    pub fn agent_spend(&self, task_id: &str, agent_id: &str) -> f64 {
        let inner = self.lock();
        if task_id == UNTRACKED_TASK {
            return inner.untracked.get(agent_id).copied().unwrap_or(0.0);
        }
        inner
            .tasks
            .get(task_id)
            .and_then(|l| l.per_agent.get(agent_id).copied())
            .unwrap_or(0.0)
    }

    /// Distinct agents that have spent on `task_id`.
    pub fn agent_count(&self, task_id: &str) -> usize {
        self.lock().tasks.get(task_id).map_or(0, |l| l.per_agent.len())
    }

    /// What is left of the task budget, never negative.
    pub fn remaining(&self, task_id: &str) -> f64 {
        (self.config.per_task - self.get_spent(task_id)).max(0.0)
    }

    /// Check current totals for `agent_id` within `task_id`.
    pub fn check_budget(&self, task_id: &str, agent_id: &str) -> BudgetStatus {
        self.check_intent(task_id, agent_id, 0.0)
    }

    /// Check totals as they would be after spending `estimated_cost`.
    pub fn check_intent(&self, task_id: &str, agent_id: &str, estimated_cost: f64) -> BudgetStatus {
        let cost = if estimated_cost.is_finite() {
            estimated_cost.max(0.0)
        } else {
            f64::INFINITY
        };
        let inner = self.lock();
        let cfg = &self.config;

        // Without a task only the agent's own limit applies.
        if task_id == UNTRACKED_TASK {
            let projected_agent = inner.untracked.get(agent_id).copied().unwrap_or(0.0) + cost;
            if projected_agent > cfg.per_agent_per_run {
                return self.exceeded(
                    task_id,
                    agent_id,
                    "agent",
                    projected_agent,
                    cfg.per_agent_per_run,
                );
            }
            return BudgetStatus::Ok {
                projected_task: 0.0,
                projected_agent,
            };
        }

        let ledger = inner.tasks.get(task_id);
        let spent = ledger.map_or(0.0, |l| l.spent);
        let agent_spent = ledger
            .and_then(|l| l.per_agent.get(agent_id).copied())
            .unwrap_or(0.0);
        let projected_task = spent + cost;
        let projected_agent = agent_spent + cost;

        if projected_task > cfg.per_task {
            return self.exceeded(task_id, agent_id, "task", projected_task, cfg.per_task);
        }
        if projected_agent > cfg.per_agent_per_run {
            return self.exceeded(
                task_id,
                agent_id,
                "agent",
                projected_agent,
                cfg.per_agent_per_run,
            );
        }

        let gaming = &cfg.gaming;
        if gaming.enabled {
            let known = ledger.map_or(0, |l| l.per_agent.len());
            let is_new = ledger.is_none_or(|l| !l.per_agent.contains_key(agent_id));
            let agents = known + usize::from(is_new && cost > 0.0);
            if agents > 0 {
                let mean_spend = projected_task / agents as f64;
                if agents >= gaming.min_agents
                    && mean_spend <= gaming.mean_spend_ratio * cfg.per_agent_per_run
                    && projected_task >= gaming.approach_ratio * cfg.per_task
                    && projected_task > cfg.per_agent_per_run
                {
                    warn!(
                        task = %task_id,
                        agents,
                        mean_spend,
                        projected_task,
                        limit = cfg.per_task,
                        "Possible budget gaming: spend spread across many agents"
                    );
                    return BudgetStatus::Gaming {
                        verdict: gaming.verdict,
                        agents,
                        mean_spend,
                        projected_task,
                    };
                }
            }
        }

        BudgetStatus::Ok {
            projected_task,
            projected_agent,
        }
    }

    fn exceeded(
        &self,
        task_id: &str,
        agent_id: &str,
        scope: &str,
        projected: f64,
        limit: f64,
    ) -> BudgetStatus {
        warn!(
            task = %task_id,
            agent = %agent_id,
            scope,
            projected,
            limit,
            "Budget exceeded"
        );
        BudgetStatus::Exceeded {
            verdict: self.config.on_exceed,
            error: BudgetError::Exceeded {
                scope: scope.to_string(),
                projected,
                limit,
            },
        }
    }

    /// Close `task_id` and reset its spend. Reusing the id later starts a
    /// fresh ledger.
    ///
    /// Returns `None` when the task never spent anything.
    pub fn close_task(&self, task_id: &str) -> Option<TaskBudgetSummary> {
        let mut inner = self.lock();
        let ledger = inner.tasks.remove(task_id)?;
        let summary = TaskBudgetSummary {
            task_id: task_id.to_string(),
            spent: ledger.spent,
            currency: self.config.currency.clone(),
            agent_spend: ledger.per_agent.into_iter().collect(),
        };
        info!(
            task = %task_id,
            spent = summary.spent,
            agents = summary.agent_spend.len(),
            "Task budget closed"
        );
        Some(summary)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> GlobalBudgetManager {
        GlobalBudgetManager::new(BudgetConfig::default())
    }

    #[test]
    fn spend_accumulates_per_task_and_agent() {
        let m = manager();
        m.add_cost("t", "a", 0.5).unwrap();
        m.add_cost("t", "b", 0.25).unwrap();
        assert_eq!(m.add_cost("t", "a", 0.25).unwrap(), 1.0);
        assert_eq!(m.get_spent("t"), 1.0);
        assert_eq!(m.agent_spend("t", "a"), 0.75);
        assert_eq!(m.agent_count("t"), 2);
        assert_eq!(m.remaining("t"), 4.0);
        assert_eq!(m.get_spent("other"), 0.0);
    }

    #[test]
    fn invalid_amounts_are_rejected() {
        let m = manager();
        assert_eq!(m.add_cost("t", "a", -1.0), Err(BudgetError::InvalidAmount(-1.0)));
        assert!(m.add_cost("t", "a", f64::NAN).is_err());
        assert!(m.add_cost("t", "a", f64::INFINITY).is_err());
        assert_eq!(m.get_spent("t"), 0.0);
    }

    #[test]
    fn task_limit_is_enforced_on_projection() {
        let m = manager();
        for agent in ["a", "b", "c", "d", "e", "f"] {
            m.add_cost("t", agent, 0.75).unwrap();
        }
        let status = m.check_intent("t", "g", 0.75);
        assert!(matches!(
            &status,
            BudgetStatus::Exceeded { verdict: Verdict::Block, error: BudgetError::Exceeded { scope, .. } }
                if scope == "task"
        ));
        // Exactly at the limit is fine.
        assert!(!matches!(
            m.check_intent("t", "g", 0.5),
            BudgetStatus::Exceeded { .. }
        ));
    }

    #[test]
    fn agent_limit_is_enforced() {
        let m = manager();
        m.add_cost("t", "a", 0.8).unwrap();
        let status = m.check_intent("t", "a", 0.3);
        assert_eq!(status.verdict(), Verdict::Block);
        assert!(m.check_budget("t", "a").is_ok());
    }

    #[test]
    fn gaming_is_flagged() {
        let m = manager();
        for i in 0..8 {
            m.add_cost("t", &format!("agent-{i}"), 0.45).unwrap();
        }
        // 3.60 so far; a ninth cheap agent pushes the task to 4.05.
        let status = m.check_intent("t", "agent-8", 0.45);
        match status {
            BudgetStatus::Gaming {
                verdict,
                agents,
                projected_task,
                ..
            } => {
                assert_eq!(verdict, Verdict::Escalate);
                assert_eq!(agents, 9);
                assert!((projected_task - 4.05).abs() < 1e-9);
            }
            other => panic!("expected gaming, got {other:?}"),
        }
    }

    #[test]
    fn few_agents_are_not_gaming() {
        let m = manager();
        m.add_cost("t", "a", 0.9).unwrap();
        m.add_cost("t", "b", 0.9).unwrap();
        // Two agents well under their own limit: not enough spread to flag.
        assert!(m.check_intent("t", "b", 0.05).is_ok());
    }

    #[test]
    fn gaming_can_be_disabled() {
        let mut config = BudgetConfig::default();
        config.gaming.enabled = false;
        let m = GlobalBudgetManager::new(config);
        for i in 0..9 {
            m.add_cost("t", &format!("agent-{i}"), 0.45).unwrap();
        }
        assert!(m.check_budget("t", "agent-0").is_ok());
    }

    #[test]
    fn crossing_the_task_limit_blocks_later_checks() {
        let m = GlobalBudgetManager::new(BudgetConfig {
            per_task: 1.0,
            per_agent_per_run: 1.0,
            ..BudgetConfig::default()
        });
        m.add_cost("t", "a1", 0.5).unwrap();
        m.add_cost("t", "a2", 0.6).unwrap();
        assert!((m.get_spent("t") - 1.1).abs() < 1e-9);
        let verdict = m.check_budget("t", "a1").verdict();
        assert!(matches!(verdict, Verdict::Block | Verdict::Escalate), "got {verdict}");
    }

    #[test]
    fn closing_a_task_resets_its_spend() {
        let m = manager();
        m.add_cost("job-42", "a", 0.5).unwrap();
        let summary = m.close_task("job-42").unwrap();
        assert_eq!(summary.spent, 0.5);
        assert_eq!(summary.agent_spend["a"], 0.5);
        assert_eq!(summary.currency, "USD");
        assert_eq!(m.get_spent("job-42"), 0.0);
        assert!(m.close_task("job-42").is_none());

        // The id is free to reuse and starts from nothing.
        assert!(m.check_intent("job-42", "a", 0.01).is_ok());
        assert_eq!(m.add_cost("job-42", "a", 0.25).unwrap(), 0.25);
        assert_eq!(m.agent_spend("job-42", "a"), 0.25);
        assert_eq!(m.agent_count("job-42"), 1);
    }

    #[test]
    fn untracked_spend_is_per_agent_only() {
        let m = manager();
        for i in 0..5 {
            m.add_cost(UNTRACKED_TASK, &format!("indep-{i}"), 1.0).unwrap();
        }
        assert_eq!(m.get_spent(UNTRACKED_TASK), 0.0);
        assert_eq!(m.agent_count(UNTRACKED_TASK), 0);
        assert_eq!(m.agent_spend(UNTRACKED_TASK, "indep-0"), 1.0);

        // Five full agents do not add up to a task overrun for a sixth.
        assert_eq!(
            m.check_intent(UNTRACKED_TASK, "fresh", 0.10),
            BudgetStatus::Ok {
                projected_task: 0.0,
                projected_agent: 0.10
            }
        );
        // Each agent's own limit still holds.
        assert!(matches!(
            m.check_intent(UNTRACKED_TASK, "indep-0", 0.05),
            BudgetStatus::Exceeded { error: BudgetError::Exceeded { ref scope, .. }, .. } if scope == "agent"
        ));
    }

    #[test]
    fn untracked_agents_are_never_gaming() {
        let m = manager();
        for i in 0..8 {
            m.add_cost(UNTRACKED_TASK, &format!("indep-{i}"), 0.5).unwrap();
        }
        assert!(m.check_intent(UNTRACKED_TASK, "indep-8", 0.2).is_ok());
    }

    #[test]
    fn concurrent_spend_is_not_lost() {
        let m = std::sync::Arc::new(manager());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = std::sync::Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.add_cost("t", &format!("a{i}"), 0.001).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!((m.get_spent("t") - 0.8).abs() < 1e-9);
    }
}
