//! Evaluator trait — the one capability every pipeline stage shares.

use crate::error::Result;
use crate::intent::ActionIntent;
use crate::verdict::Verdict;
use serde::{Deserialize, Serialize};

/// How an evaluator's own failure is converted into a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Treat the failure as BLOCK.
    #[default]
    FailClosed,
    /// Treat the failure as ALLOW. For explicitly non-critical evaluators.
    FailOpen,
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrigin {
    /// A genuine decision by the evaluator.
    #[default]
    Evaluated,
    /// The evaluator failed and its failure mode produced BLOCK.
    FailClosed,
    /// The evaluator failed and its failure mode produced ALLOW.
    FailOpen,
}

impl ResultOrigin {
    pub fn is_internal_error(self) -> bool {
        !matches!(self, ResultOrigin::Evaluated)
    }
}

/// The output of a single evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorResult {
    pub verdict: Verdict,
    pub reason: String,
    /// How confident the evaluator is, in [0, 1].
    pub confidence: f64,
    pub evaluator_name: String,
    /// The specific rule, policy, or check that produced the verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub origin: ResultOrigin,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EvaluatorResult {
    pub fn new(evaluator_name: impl Into<String>, verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            confidence: 1.0,
            evaluator_name: evaluator_name.into(),
            rule: None,
            risk_score: None,
            origin: ResultOrigin::Evaluated,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn allow(evaluator_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(evaluator_name, Verdict::Allow, reason)
    }

    pub fn block(evaluator_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(evaluator_name, Verdict::Block, reason)
    }

    /// Result for an evaluator that errored or panicked.
    pub fn from_failure(evaluator_name: impl Into<String>, mode: FailureMode, error: &str) -> Self {
        let (verdict, origin, prefix) = match mode {
            FailureMode::FailClosed => (Verdict::Block, ResultOrigin::FailClosed, "fail-closed"),
            FailureMode::FailOpen => (Verdict::Allow, ResultOrigin::FailOpen, "fail-open"),
        };
        let mut result = Self::new(
            evaluator_name,
            verdict,
            format!("internal evaluator error ({prefix}): {error}"),
        );
        result.origin = origin;
        result.confidence = 0.0;
        result
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A pluggable stage of the evaluation pipeline.
///
/// Evaluators are synchronous: every check is CPU-bound and sized for a
/// sub-millisecond budget. Shared state behind an evaluator must carry
/// its own synchronization; the pipeline never grants exclusive access.
pub trait Evaluator: Send + Sync {
    /// Unique name, used in results and registry operations.
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    fn failure_mode(&self) -> FailureMode {
        FailureMode::FailClosed
    }

    fn evaluate(&self, intent: &ActionIntent) -> Result<EvaluatorResult>;

    /// The answer [`evaluate`](Self::evaluate) would give, leaving shared
    /// state untouched. Evaluators that record calls override this.
    fn preview(&self, intent: &ActionIntent) -> Result<EvaluatorResult> {
        self.evaluate(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_results_are_flagged() {
        let closed = EvaluatorResult::from_failure("policy", FailureMode::FailClosed, "boom");
        assert_eq!(closed.verdict, Verdict::Block);
        assert!(closed.origin.is_internal_error());
        assert!(closed.reason.contains("boom"));

        let open = EvaluatorResult::from_failure("risk", FailureMode::FailOpen, "boom");
        assert_eq!(open.verdict, Verdict::Allow);
        assert_eq!(open.origin, ResultOrigin::FailOpen);
    }

    #[test]
    fn confidence_is_clamped() {
        let r = EvaluatorResult::allow("x", "ok").with_confidence(3.0);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn failure_mode_deserializes_snake_case() {
        let mode: FailureMode = serde_json::from_str("\"fail_open\"").unwrap();
        assert_eq!(mode, FailureMode::FailOpen);
        assert_eq!(FailureMode::default(), FailureMode::FailClosed);
    }
}
