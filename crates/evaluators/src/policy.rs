//! Pipeline stage backed by the policy engine.
//!
//! The engine itself is fail-open: no match is a neutral ALLOW. This stage
//! turns "nothing matched" into the configured default verdict and feeds
//! the engine the agent facts that live outside the intent.

use crate::Stage;
use actionguard_config::{EvaluatorSettings, PolicyConfig};
use actionguard_core::{ActionIntent, Evaluator, EvaluatorResult, FailureMode, Result, Verdict};
use actionguard_multiagent::{GlobalBudgetManager, TrustLedger, UNTRACKED_TASK};
use actionguard_policy::{AgentFacts, POLICY_EVALUATOR, PolicyEngine, PolicyError, PolicyTrace};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct PolicyEvaluator {
    engine: RwLock<Arc<PolicyEngine>>,
    default_verdict: Verdict,
    trust: Arc<TrustLedger>,
    budget: Arc<GlobalBudgetManager>,
    stage: Stage,
}

impl PolicyEvaluator {
    pub fn new(
        engine: PolicyEngine,
        default_verdict: Verdict,
        trust: Arc<TrustLedger>,
        budget: Arc<GlobalBudgetManager>,
    ) -> Self {
        Self {
            engine: RwLock::new(Arc::new(engine)),
            default_verdict,
            trust,
            budget,
            stage: Stage::new(20),
        }
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }

    /// Current engine snapshot.
    pub fn engine(&self) -> Arc<PolicyEngine> {
        Arc::clone(&self.engine.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swap in a freshly compiled policy set. Evaluations already running
    /// keep the snapshot they started with. Returns the rejected policies.
    pub fn reload(&self, configs: &[PolicyConfig]) -> Vec<PolicyError> {
        let report = PolicyEngine::load(configs);
        info!(
            policies = report.engine.len(),
            rejected = report.rejected.len(),
            "Policies reloaded"
        );
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(report.engine);
        report.rejected
    }

    /// Facts about `intent`'s caller, read from the ledger and the budget.
    pub fn facts(&self, intent: &ActionIntent) -> AgentFacts {
        let task = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        AgentFacts {
            trust_level: self.trust.trust_level(&intent.agent_id).unwrap_or(0.0),
            action_count: self.trust.action_count(&intent.agent_id),
            task_spent: self.budget.get_spent(task),
        }
    }

    /// Dry run of every policy against `intent`.
    pub fn explain(&self, intent: &ActionIntent) -> Vec<PolicyTrace> {
        self.engine().explain(intent, self.facts(intent))
    }
}

impl Evaluator for PolicyEvaluator {
    fn name(&self) -> &str {
        POLICY_EVALUATOR
    }

    fn priority(&self) -> i32 {
        self.stage.priority
    }

    fn failure_mode(&self) -> FailureMode {
        self.stage.failure_mode
    }

    fn evaluate(&self, intent: &ActionIntent) -> Result<EvaluatorResult> {
        let engine = self.engine();
        let result = engine.evaluate(intent, self.facts(intent));

        let matched = result
            .metadata
            .get("matched")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if matched || self.default_verdict == Verdict::Allow {
            return Ok(result);
        }

        match self.default_verdict {
            Verdict::Block => warn!(
                action_type = %intent.action_type,
                agent = %intent.agent_id,
                "No policy matched; default verdict BLOCK"
            ),
            verdict => debug!(
                action_type = %intent.action_type,
                verdict = %verdict,
                "No policy matched; applying default verdict"
            ),
        }
        Ok(EvaluatorResult::new(
            POLICY_EVALUATOR,
            self.default_verdict,
            format!("No policy matched; default verdict is {}", self.default_verdict),
        )
        .with_rule("default_verdict")
        .with_metadata("matched", false.into()))
    }
}
