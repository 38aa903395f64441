//! # ActionGuard Evaluators
//!
//! The six built-in pipeline stages, in their default order:
//!
//! | Priority | Evaluator | Decides on |
//! |---|---|---|
//! | 10 | [`SchemaValidator`] | malformed intents |
//! | 20 | [`PolicyEvaluator`] | declarative policies |
//! | 30 | [`RiskScorer`] | weighted risk against a trust-scaled threshold |
//! | 40 | [`RateLimiter`] | calls per (agent, tool) in a sliding window |
//! | 50 | [`BudgetEvaluator`] | task and agent spend |
//! | 60 | [`ApprovalGate`] | actions that always need a human |
//!
//! Every stage's priority and failure mode can be overridden from
//! configuration through [`Stage`].

pub mod approval;
pub mod budget;
pub mod policy;
pub mod rate_limit;
pub mod risk;
pub mod schema;

pub use approval::ApprovalGate;
pub use budget::BudgetEvaluator;
pub use policy::PolicyEvaluator;
pub use rate_limit::RateLimiter;
pub use risk::{RiskBreakdown, RiskInputs, RiskScorer, parameter_sensitivity};
pub use schema::SchemaValidator;

use actionguard_config::EvaluatorSettings;
use actionguard_core::FailureMode;

/// Where a stage sits in the pipeline and how its failures count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub priority: i32,
    pub failure_mode: FailureMode,
}

impl Stage {
    pub const fn new(priority: i32) -> Self {
        Self {
            priority,
            failure_mode: FailureMode::FailClosed,
        }
    }

    /// Apply configured overrides.
    pub fn configured(self, settings: &EvaluatorSettings) -> Self {
        Self {
            priority: settings.priority.unwrap_or(self.priority),
            failure_mode: settings.failure_mode,
        }
    }
}
