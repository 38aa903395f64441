//! Weighted risk scoring.
//!
//! Five signals, each in `[0, 1]`, are combined with the configured
//! weights (which sum to 1):
//!
//! - **severity**: how dangerous the action type is, floored by the
//!   intent's declared risk level
//! - **sensitivity**: secrets, personal data and system paths in the
//!   parameters
//! - **history**: the agent's block rate so far
//! - **cost**: the estimated cost as a share of the remaining task budget
//! - **trust**: `1 - effective_trust` over the whole instruction chain
//!
//! The threshold scales with trust: an action is flagged when its score
//! is strictly above `max_risk_score * effective_trust`.

use crate::Stage;
use actionguard_config::{EvaluatorSettings, GlobalConfig, RiskConfig, RiskWeights};
use actionguard_core::{ActionIntent, Evaluator, EvaluatorResult, FailureMode, Result, Verdict};
use actionguard_multiagent::{GlobalBudgetManager, TrustLedger, UNTRACKED_TASK};
use actionguard_policy::{contains_pii, is_sensitive_path};
use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

pub const NAME: &str = "risk_scorer";

/// Severity for action types found in neither table.
const UNKNOWN_SEVERITY: f64 = 0.3;

const MAX_SCAN_DEPTH: usize = 5;
const MATCH_WEIGHT: f64 = 0.25;
const SYSTEM_PATH_WEIGHT: f64 = 0.5;

const ACTION_SEVERITY: &[(&str, f64)] = &[
    ("file.read", 0.1),
    ("db.select", 0.1),
    ("db.query", 0.1),
    ("http.get", 0.1),
    ("file.create", 0.3),
    ("db.insert", 0.3),
    ("http.post", 0.3),
    ("email.send", 0.3),
    ("file.write", 0.5),
    ("db.update", 0.5),
    ("http.put", 0.5),
    ("http.patch", 0.5),
    ("file.delete", 0.8),
    ("db.delete", 0.8),
    ("http.delete", 0.8),
    ("shell.exec", 0.9),
    ("code.exec", 0.9),
    ("system.exec", 0.9),
];

const VERB_SEVERITY: &[(&str, f64)] = &[
    ("read", 0.1),
    ("get", 0.1),
    ("query", 0.1),
    ("select", 0.1),
    ("list", 0.1),
    ("create", 0.3),
    ("post", 0.3),
    ("insert", 0.3),
    ("send", 0.3),
    ("write", 0.5),
    ("update", 0.5),
    ("put", 0.5),
    ("patch", 0.5),
    ("delete", 0.8),
    ("destroy", 0.8),
    ("remove", 0.8),
    ("drop", 0.8),
    ("exec", 0.9),
    ("execute", 0.9),
    ("shell", 0.9),
    ("run", 0.9),
];

static SENSITIVE_KEYWORDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)password",
        r"(?i)secret",
        r"(?i)token",
        r"(?i)api[_-]?key",
        r"(?i)credential",
        r"(?i)private[_-]?key",
        r"(?i)credit[_-]?card",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Sensitivity of a parameter tree, in `[0, 1]`.
///
/// Keys and string values are scanned to depth 5. Each keyword or PII hit
/// adds 0.25; a value under a system directory adds 0.5.
pub fn parameter_sensitivity(params: &serde_json::Value) -> f64 {
    fn text_score(text: &str) -> f64 {
        let keywords = SENSITIVE_KEYWORDS.iter().filter(|re| re.is_match(text)).count();
        keywords as f64 * MATCH_WEIGHT + if contains_pii(text) { MATCH_WEIGHT } else { 0.0 }
    }

    fn scan(value: &serde_json::Value, depth: usize, total: &mut f64) {
        if depth > MAX_SCAN_DEPTH || *total >= 1.0 {
            return;
        }
        match value {
            serde_json::Value::String(s) => {
                *total += text_score(s);
                if is_sensitive_path(s) {
                    *total += SYSTEM_PATH_WEIGHT;
                }
            }
            serde_json::Value::Object(map) => {
                for (key, v) in map {
                    *total += text_score(key);
                    scan(v, depth + 1, total);
                }
            }
            serde_json::Value::Array(items) => {
                for v in items {
                    scan(v, depth + 1, total);
                }
            }
            _ => {}
        }
    }

    let mut total = 0.0;
    scan(params, 0, &mut total);
    total.min(1.0)
}

/// Everything a score depends on. Scoring is a pure function of this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskInputs {
    pub severity: f64,
    pub sensitivity: f64,
    pub block_rate: f64,
    pub estimated_cost: f64,
    pub remaining_budget: f64,
    pub effective_trust: f64,
}

/// A score with the signals that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskBreakdown {
    pub severity: f64,
    pub sensitivity: f64,
    pub history: f64,
    pub cost: f64,
    pub trust: f64,
    pub score: f64,
    pub threshold: f64,
    pub exceeded: bool,
}

pub struct RiskScorer {
    weights: RiskWeights,
    severities: HashMap<String, f64>,
    max_risk_score: f64,
    on_exceeded: Verdict,
    trust: Arc<TrustLedger>,
    budget: Arc<GlobalBudgetManager>,
    stage: Stage,
}

impl RiskScorer {
    pub fn new(
        config: &RiskConfig,
        global: &GlobalConfig,
        trust: Arc<TrustLedger>,
        budget: Arc<GlobalBudgetManager>,
    ) -> Self {
        let mut severities: HashMap<String, f64> = ACTION_SEVERITY
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        for (action_type, risk) in &config.base_risks {
            severities.insert(action_type.clone(), risk.clamp(0.0, 1.0));
        }
        Self {
            weights: config.weights,
            severities,
            max_risk_score: global.max_risk_score,
            on_exceeded: global.on_risk_exceeded,
            trust,
            budget,
            stage: Stage::new(30),
        }
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }

    /// Base risk of an action type: exact entry first, then verb segments
    /// from the right.
    pub fn action_severity(&self, action_type: &str) -> f64 {
        if let Some(risk) = self.severities.get(action_type) {
            return *risk;
        }
        let lower = action_type.to_ascii_lowercase();
        lower
            .rsplit('.')
            .find_map(|verb| VERB_SEVERITY.iter().find(|(v, _)| *v == verb).map(|(_, r)| *r))
            .unwrap_or(UNKNOWN_SEVERITY)
    }

    /// Gather inputs for `intent` from the intent, ledger and budget.
    pub fn inputs(&self, intent: &ActionIntent) -> RiskInputs {
        let task = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        RiskInputs {
            severity: self
                .action_severity(&intent.action_type)
                .max(intent.risk_level.base_score()),
            sensitivity: parameter_sensitivity(&intent.parameters),
            block_rate: self.trust.block_rate(&intent.agent_id),
            estimated_cost: intent.estimated_cost,
            remaining_budget: self.budget.remaining(task),
            effective_trust: self
                .trust
                .effective_trust(&intent.instruction_chain, &intent.agent_id),
        }
    }

    pub fn score(&self, inputs: &RiskInputs) -> RiskBreakdown {
        let unit = |x: f64| if x.is_nan() { 1.0 } else { x.clamp(0.0, 1.0) };

        let cost = if inputs.estimated_cost <= 0.0 {
            0.0
        } else if inputs.remaining_budget <= 0.0 {
            1.0
        } else {
            unit(inputs.estimated_cost / inputs.remaining_budget)
        };
        let trust_level = unit(inputs.effective_trust);

        let severity = unit(inputs.severity);
        let sensitivity = unit(inputs.sensitivity);
        let history = unit(inputs.block_rate);
        let trust = 1.0 - trust_level;

        let w = &self.weights;
        let score = unit(
            w.severity * severity
                + w.sensitivity * sensitivity
                + w.history * history
                + w.cost * cost
                + w.trust * trust,
        );
        let threshold = self.max_risk_score * trust_level;

        RiskBreakdown {
            severity,
            sensitivity,
            history,
            cost,
            trust,
            score,
            threshold,
            exceeded: score > threshold,
        }
    }
}

impl Evaluator for RiskScorer {
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
        let b = self.score(&self.inputs(intent));
        let breakdown = serde_json::to_value(&b)?;

        if !b.exceeded {
            debug!(
                action_type = %intent.action_type,
                agent = %intent.agent_id,
                score = b.score,
                threshold = b.threshold,
                "Risk within threshold"
            );
            return Ok(EvaluatorResult::allow(
                NAME,
                format!("risk score {:.3} within threshold {:.3}", b.score, b.threshold),
            )
            .with_risk_score(b.score)
            .with_metadata("breakdown", breakdown));
        }

        warn!(
            action_type = %intent.action_type,
            agent = %intent.agent_id,
            score = b.score,
            threshold = b.threshold,
            verdict = %self.on_exceeded,
            "Risk threshold exceeded"
        );
        Ok(EvaluatorResult::new(
            NAME,
            self.on_exceeded,
            format!(
                "risk score {:.3} exceeds trust-scaled threshold {:.3}",
                b.score, b.threshold
            ),
        )
        .with_rule("risk.threshold")
        .with_confidence(0.9)
        .with_risk_score(b.score)
        .with_metadata("breakdown", breakdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionguard_config::BudgetConfig;
    use actionguard_core::{AgentCall, InstructionChain, RiskLevel};
    use serde_json::json;

    fn scorer() -> (RiskScorer, Arc<TrustLedger>) {
        let trust = Arc::new(TrustLedger::new());
        let budget = Arc::new(GlobalBudgetManager::new(BudgetConfig::default()));
        let s = RiskScorer::new(
            &RiskConfig::default(),
            &GlobalConfig::default(),
            Arc::clone(&trust),
            budget,
        );
        (s, trust)
    }

    fn inputs() -> RiskInputs {
        RiskInputs {
            severity: 0.1,
            sensitivity: 0.0,
            block_rate: 0.0,
            estimated_cost: 0.0,
            remaining_budget: 10.0,
            effective_trust: 1.0,
        }
    }

    #[test]
    fn severity_lookup() {
        let (s, _) = scorer();
        assert_eq!(s.action_severity("file.delete"), 0.8);
        assert_eq!(s.action_severity("s3.bucket.remove"), 0.8);
        assert_eq!(s.action_severity("vector.Query"), 0.1);
        assert_eq!(s.action_severity("mystery"), UNKNOWN_SEVERITY);
    }

    #[test]
    fn base_risk_overrides_apply() {
        let mut cfg = RiskConfig::default();
        cfg.base_risks.insert("file.read".into(), 0.7);
        let s = RiskScorer::new(
            &cfg,
            &GlobalConfig::default(),
            Arc::new(TrustLedger::new()),
            Arc::new(GlobalBudgetManager::new(BudgetConfig::default())),
        );
        assert_eq!(s.action_severity("file.read"), 0.7);
    }

    #[test]
    fn sensitivity_scan() {
        assert_eq!(parameter_sensitivity(&json!({"query": "weather"})), 0.0);
        assert_eq!(parameter_sensitivity(&json!({"api_key": "x"})), 0.25);
        assert_eq!(parameter_sensitivity(&json!({"path": "/etc/shadow"})), 0.5);
        assert_eq!(
            parameter_sensitivity(&json!({"to": "a@b.com", "password": "/etc/x", "token": 1})),
            1.0
        );
        // Below the scan depth limit nothing counts.
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": "secret"}}}}}}});
        assert_eq!(parameter_sensitivity(&deep), 0.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let (s, _) = scorer();
        let i = RiskInputs {
            severity: 0.5,
            sensitivity: 0.25,
            block_rate: 0.2,
            estimated_cost: 1.0,
            remaining_budget: 4.0,
            effective_trust: 0.8,
        };
        let a = s.score(&i);
        assert_eq!(a, s.score(&i));
        let expected = 0.3 * 0.5 + 0.25 * 0.25 + 0.15 * 0.2 + 0.15 * 0.25 + 0.15 * (1.0 - 0.8);
        assert!((a.score - expected).abs() < 1e-9);
    }

    #[test]
    fn cost_signal() {
        let (s, _) = scorer();
        let mut i = inputs();
        i.estimated_cost = 5.0;
        i.remaining_budget = 0.0;
        assert_eq!(s.score(&i).cost, 1.0);
        i.remaining_budget = 20.0;
        assert_eq!(s.score(&i).cost, 0.25);
        i.estimated_cost = 0.0;
        i.remaining_budget = 0.0;
        assert_eq!(s.score(&i).cost, 0.0);
    }

    #[test]
    fn threshold_scales_with_trust() {
        let (s, _) = scorer();
        let mut i = inputs();
        i.severity = 0.9;
        i.effective_trust = 1.0;
        let trusted = s.score(&i);
        assert!(!trusted.exceeded);

        i.effective_trust = 0.2;
        let untrusted = s.score(&i);
        assert!(untrusted.exceeded);
        assert!(untrusted.threshold < trusted.threshold);
    }

    #[test]
    fn unregistered_agents_are_flagged() {
        let (s, _) = scorer();
        let intent = ActionIntent::new("file.read", "fs", "stranger");
        let r = s.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.rule.as_deref(), Some("risk.threshold"));
    }

    #[test]
    fn weakest_hop_sets_the_threshold() {
        let (s, trust) = scorer();
        trust.register("human", 1.0);
        trust.register("worker", 1.0);
        trust.register("shaky", 0.1);

        let read = ActionIntent::new("file.read", "fs", "worker").with_risk_level(RiskLevel::Low);
        let r = s.evaluate(&read).unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
        assert!(r.risk_score.is_some());

        let chain: InstructionChain = [
            AgentCall::new("human", 1.0, "plan"),
            AgentCall::new("shaky", 1.0, "do it"),
        ]
        .into_iter()
        .collect();
        let r = s.evaluate(&read.clone().with_chain(chain)).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
    }
}
