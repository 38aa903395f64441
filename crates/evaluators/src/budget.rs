//! Budget stage: refuses spend that would push a task or agent over its
//! limit, and flags spend spread thin across many agents.

use crate::Stage;
use actionguard_config::EvaluatorSettings;
use actionguard_core::{ActionIntent, BudgetError, Evaluator, EvaluatorResult, FailureMode, Result};
use actionguard_multiagent::{BudgetStatus, GlobalBudgetManager, UNTRACKED_TASK};
use std::sync::Arc;

pub const NAME: &str = "budget";

pub struct BudgetEvaluator {
    budget: Arc<GlobalBudgetManager>,
    stage: Stage,
}

impl BudgetEvaluator {
    pub fn new(budget: Arc<GlobalBudgetManager>) -> Self {
        Self {
            budget,
            stage: Stage::new(50),
        }
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }
}

impl Evaluator for BudgetEvaluator {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.stage.priority
    }

    fn failure_mode(&self) -> FailureMode {
        self.stage.failure_mode
    }

    fn evaluate(&self, intent: &ActionIntent) -> Result<EvaluatorResult> {
        let task = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        let currency = &self.budget.config().currency;

        let result = match self
            .budget
            .check_intent(task, &intent.agent_id, intent.estimated_cost)
        {
            BudgetStatus::Ok {
                projected_task,
                projected_agent,
            } => EvaluatorResult::allow(
                NAME,
                format!("projected spend {projected_task:.2} {currency} within budget"),
            )
            .with_metadata("projected_task", projected_task.into())
            .with_metadata("projected_agent", projected_agent.into()),

            BudgetStatus::Exceeded { verdict, error } => {
                let mut r = EvaluatorResult::new(NAME, verdict, error.to_string())
                    .with_rule("budget.exceeded");
                if let BudgetError::Exceeded {
                    scope,
                    projected,
                    limit,
                } = &error
                {
                    r = r
                        .with_metadata("scope", scope.clone().into())
                        .with_metadata("projected", (*projected).into())
                        .with_metadata("limit", (*limit).into());
                }
                r
            }

            BudgetStatus::Gaming {
                verdict,
                agents,
                mean_spend,
                projected_task,
            } => EvaluatorResult::new(
                NAME,
                verdict,
                format!(
                    "task spend {projected_task:.2} {currency} is spread across {agents} agents \
                     averaging {mean_spend:.2} each while nearing the task limit"
                ),
            )
            .with_rule("budget.gaming")
            .with_confidence(0.7)
            .with_metadata("agents", agents.into())
            .with_metadata("mean_spend", mean_spend.into()),
        };
        Ok(result.with_metadata("task_id", task.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionguard_config::BudgetConfig;
    use actionguard_core::Verdict;

    fn budget(per_task: f64, per_agent: f64) -> Arc<GlobalBudgetManager> {
        Arc::new(GlobalBudgetManager::new(BudgetConfig {
            per_task,
            per_agent_per_run: per_agent,
            ..BudgetConfig::default()
        }))
    }

    #[test]
    fn spend_within_budget_is_allowed() {
        let b = budget(10.0, 5.0);
        let eval = BudgetEvaluator::new(Arc::clone(&b));
        let intent = ActionIntent::new("http.post", "web", "a").with_task("t").with_cost(1.0);
        let r = eval.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
        assert_eq!(r.metadata["projected_task"], 1.0);
    }

    #[test]
    fn projected_overspend_is_refused() {
        let b = budget(1.0, 1.0);
        b.add_cost("t", "a1", 0.5).unwrap();
        let eval = BudgetEvaluator::new(Arc::clone(&b));
        let intent = ActionIntent::new("http.post", "web", "a2").with_task("t").with_cost(0.6);
        let r = eval.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.rule.as_deref(), Some("budget.exceeded"));
        assert_eq!(r.metadata["scope"], "task");
    }

    #[test]
    fn task_over_its_limit_is_refused() {
        let b = budget(1.0, 1.0);
        b.add_cost("t", "a1", 0.5).unwrap();
        b.add_cost("t", "a2", 0.6).unwrap();
        let eval = BudgetEvaluator::new(b);
        let r = eval
            .evaluate(&ActionIntent::new("http.post", "web", "a1").with_task("t"))
            .unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.metadata["scope"], "task");
    }

    #[test]
    fn a_closed_task_id_can_be_reused() {
        let b = budget(10.0, 5.0);
        b.add_cost("job-42", "a", 9.5).unwrap();
        b.close_task("job-42");
        let eval = BudgetEvaluator::new(b);
        let intent = ActionIntent::new("http.post", "web", "a").with_task("job-42").with_cost(1.0);
        let r = eval.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
        assert_eq!(r.metadata["projected_task"], 1.0);
    }

    #[test]
    fn thin_spread_is_flagged() {
        let b = budget(5.0, 2.0);
        for agent in ["a1", "a2", "a3", "a4", "a5"] {
            b.add_cost("t", agent, 0.75).unwrap();
        }
        let eval = BudgetEvaluator::new(b);
        let intent = ActionIntent::new("http.post", "web", "a6").with_task("t").with_cost(0.75);
        let r = eval.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Escalate);
        assert_eq!(r.rule.as_deref(), Some("budget.gaming"));
        assert_eq!(r.metadata["agents"], 6);
    }

    #[test]
    fn intents_without_a_task_are_limited_per_agent() {
        let b = budget(5.0, 5.0);
        for i in 0..5 {
            b.add_cost(UNTRACKED_TASK, &format!("indep-{i}"), 1.0).unwrap();
        }
        let eval = BudgetEvaluator::new(Arc::clone(&b));
        let r = eval
            .evaluate(&ActionIntent::new("http.post", "web", "fresh").with_cost(0.10))
            .unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
        assert_eq!(r.metadata["task_id"], UNTRACKED_TASK);

        b.add_cost(UNTRACKED_TASK, "heavy", 4.5).unwrap();
        let r = eval
            .evaluate(&ActionIntent::new("http.post", "web", "heavy").with_cost(1.0))
            .unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.metadata["scope"], "agent");
    }

    #[test]
    fn independent_agents_without_a_task_are_not_gaming() {
        let b = budget(5.0, 1.0);
        for i in 0..8 {
            b.add_cost(UNTRACKED_TASK, &format!("indep-{i}"), 0.5).unwrap();
        }
        let eval = BudgetEvaluator::new(b);
        let r = eval
            .evaluate(&ActionIntent::new("http.post", "web", "indep-8").with_cost(0.2))
            .unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
        assert_eq!(r.rule, None);
    }
}
