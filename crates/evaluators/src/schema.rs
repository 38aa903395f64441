//! Structural checks on an intent before anything else looks at it.

use crate::Stage;
use actionguard_config::EvaluatorSettings;
use actionguard_core::{ActionIntent, Evaluator, EvaluatorResult, FailureMode, Result, Verdict};

pub const NAME: &str = "schema_validator";

#[derive(Debug, Clone)]
pub struct SchemaValidator {
    stage: Stage,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self {
            stage: Stage::new(10),
        }
    }
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }

    /// Every problem with `intent`, in a fixed order.
    pub fn problems(intent: &ActionIntent) -> Vec<String> {
        let mut errors = Vec::new();
        let blank = |s: &str| s.trim().is_empty();

        if blank(&intent.action_id) {
            errors.push("action_id must be non-empty".to_string());
        }
        if blank(&intent.action_type) {
            errors.push("action_type must be non-empty".to_string());
        } else if intent.action_type.split('.').any(|seg| seg.trim().is_empty()) {
            errors.push(format!(
                "action_type '{}' has an empty dotted segment",
                intent.action_type
            ));
        }
        if blank(&intent.tool_name) {
            errors.push("tool_name must be non-empty".to_string());
        }
        if blank(&intent.agent_id) {
            errors.push("agent_id must be non-empty".to_string());
        }
        if !intent.parameters.is_object() {
            errors.push("parameters must be an object".to_string());
        }
        if !intent.estimated_cost.is_finite() || intent.estimated_cost < 0.0 {
            errors.push("estimated_cost must be a non-negative number".to_string());
        }
        errors
    }
}

impl Evaluator for SchemaValidator {
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
        let errors = Self::problems(intent);
        if errors.is_empty() {
            return Ok(EvaluatorResult::allow(NAME, "intent is well-formed"));
        }
        Ok(EvaluatorResult::new(
            NAME,
            Verdict::Block,
            format!("schema validation failed: {}", errors.join("; ")),
        )
        .with_rule("schema.invalid")
        .with_metadata("errors", errors.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_intent_passes() {
        let intent = ActionIntent::new("file.read", "fs", "bot");
        let r = SchemaValidator::new().evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Allow);
    }

    #[test]
    fn every_problem_is_reported() {
        let intent = ActionIntent::new("file..read", "", " ")
            .with_parameters(json!(["not", "an", "object"]))
            .with_cost(-1.0);
        let r = SchemaValidator::new().evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.rule.as_deref(), Some("schema.invalid"));
        assert_eq!(r.metadata["errors"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn non_finite_cost_is_invalid() {
        let intent = ActionIntent::new("http.get", "web", "bot").with_cost(f64::NAN);
        assert_eq!(SchemaValidator::problems(&intent).len(), 1);
    }

    #[test]
    fn empty_action_id_is_invalid() {
        let mut intent = ActionIntent::new("http.get", "web", "bot");
        intent.action_id.clear();
        assert_eq!(
            SchemaValidator::problems(&intent),
            vec!["action_id must be non-empty".to_string()]
        );
    }
}
