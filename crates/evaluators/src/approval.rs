//! Approval gate: actions that always wait for a human.

use crate::Stage;
use actionguard_config::{ApprovalConfig, EvaluatorSettings};
use actionguard_core::{
    ActionIntent, Evaluator, EvaluatorResult, FailureMode, Result, RiskLevel, Verdict,
};
use glob::Pattern;
use tracing::{info, warn};

pub const NAME: &str = "approval_gate";

pub struct ApprovalGate {
    risk_levels: Vec<RiskLevel>,
    action_types: Vec<Pattern>,
    verdict: Verdict,
    stage: Stage,
}

impl ApprovalGate {
    /// Build the gate. Globs that do not parse are skipped with a warning.
    pub fn new(config: &ApprovalConfig) -> Self {
        let action_types = config
            .action_types
            .iter()
            .filter_map(|g| match Pattern::new(g) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %g, error = %e, "Ignoring invalid approval glob");
                    None
                }
            })
            .collect();
        Self {
            risk_levels: config.risk_levels.clone(),
            action_types,
            verdict: config.verdict,
            stage: Stage::new(60),
        }
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }

    /// Why `intent` needs approval, if it does.
    fn trigger(&self, intent: &ActionIntent) -> Option<String> {
        if self.risk_levels.contains(&intent.risk_level) {
            return Some(format!("risk level {}", intent.risk_level));
        }
        self.action_types
            .iter()
            .find(|p| p.matches(&intent.action_type))
            .map(|p| format!("action type matches '{}'", p.as_str()))
    }
}

impl Evaluator for ApprovalGate {
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
        let Some(trigger) = self.trigger(intent) else {
            return Ok(EvaluatorResult::allow(NAME, "no approval required"));
        };
        info!(
            action_id = %intent.action_id,
            action_type = %intent.action_type,
            agent = %intent.agent_id,
            verdict = %self.verdict,
            "Approval required: {}",
            trigger
        );
        Ok(EvaluatorResult::new(
            NAME,
            self.verdict,
            format!("human approval required: {trigger}"),
        )
        .with_rule("approval.required")
        .with_metadata("trigger", trigger.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(action_types: &[&str]) -> ApprovalGate {
        ApprovalGate::new(&ApprovalConfig {
            action_types: action_types.iter().map(|s| s.to_string()).collect(),
            ..ApprovalConfig::default()
        })
    }

    #[test]
    fn critical_actions_escalate() {
        let g = gate(&[]);
        let intent = ActionIntent::new("db.drop", "db", "bot").with_risk_level(RiskLevel::Critical);
        let r = g.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Escalate);
        assert_eq!(r.rule.as_deref(), Some("approval.required"));

        let low = ActionIntent::new("db.drop", "db", "bot").with_risk_level(RiskLevel::Low);
        assert_eq!(g.evaluate(&low).unwrap().verdict, Verdict::Allow);
    }

    #[test]
    fn action_type_globs_trigger_approval() {
        let g = gate(&["payment.*", "[invalid"]);
        assert_eq!(g.action_types.len(), 1);
        let intent = ActionIntent::new("payment.refund", "stripe", "bot");
        let r = g.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Escalate);
        assert_eq!(r.metadata["trigger"], "action type matches 'payment.*'");
    }

    #[test]
    fn defer_can_be_configured() {
        let g = ApprovalGate::new(&ApprovalConfig {
            verdict: Verdict::Defer,
            ..ApprovalConfig::default()
        });
        let intent = ActionIntent::new("x.y", "t", "bot").with_risk_level(RiskLevel::Critical);
        assert_eq!(g.evaluate(&intent).unwrap().verdict, Verdict::Defer);
    }
}
