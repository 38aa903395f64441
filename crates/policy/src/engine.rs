//! Policy enforcement engine.
//!
//! The engine scans policies in declaration order and returns the verdict
//! of the first one whose globs and condition both match. It is immutable
//! once loaded; reloading builds a new engine.

use crate::PolicyError;
use crate::context::{AgentFacts, build_context};
use crate::model::{Policy, resolve_inheritance};
use actionguard_config::PolicyConfig;
use actionguard_core::{ActionIntent, EvaluatorResult, Verdict};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Name used on results produced by the engine.
pub const POLICY_EVALUATOR: &str = "policy";

/// The outcome of loading a policy list.
#[derive(Debug)]
pub struct LoadReport {
    pub engine: PolicyEngine,
    /// Policies that were left out, with the reason.
    pub rejected: Vec<PolicyError>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// One policy's part in a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyTrace {
    pub policy: String,
    pub enabled: bool,
    pub glob_matched: bool,
    /// `None` when the condition was not evaluated.
    pub condition: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub verdict: Verdict,
    /// This is the policy a real evaluation would pick.
    pub selected: bool,
}

/// A policy that can never fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shadowed {
    pub policy: String,
    /// The earlier unconditional policy that always wins first.
    pub by: String,
}

/// First-match policy engine.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile `configs`. A policy that fails to compile is rejected on its
    /// own; the rest still load.
    pub fn load(configs: &[PolicyConfig]) -> LoadReport {
        let mut policies = Vec::with_capacity(configs.len());
        let mut rejected = Vec::new();
        let mut names = HashSet::new();

        for (config, resolved) in configs.iter().zip(resolve_inheritance(configs)) {
            if !names.insert(config.name.trim().to_string()) {
                rejected.push(PolicyError::Invalid {
                    name: config.name.clone(),
                    reason: "duplicate policy name".into(),
                });
                continue;
            }
            match resolved.and_then(|c| Policy::compile(&c)) {
                Ok(policy) => policies.push(policy),
                Err(e) => {
                    warn!(policy = %config.name, error = %e, "Policy rejected");
                    rejected.push(e);
                }
            }
        }

        info!(
            loaded = policies.len(),
            rejected = rejected.len(),
            "Policies loaded"
        );
        LoadReport {
            engine: Self { policies },
            rejected,
        }
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Number of enabled policies.
    pub fn active_count(&self) -> usize {
        self.policies.iter().filter(|p| p.enabled).count()
    }

    /// The first enabled policy matching `action_type` whose condition holds.
    ///
    /// A condition that fails to evaluate counts as not matching.
    pub fn find_match(&self, action_type: &str, ctx: &serde_json::Value) -> Option<&Policy> {
        self.policies
            .iter()
            .filter(|p| p.enabled && p.matches_action(action_type))
            .find(|p| match p.condition().evaluate(ctx) {
                Ok(hit) => hit,
                Err(e) => {
                    warn!(
                        policy = %p.name,
                        action_type = %action_type,
                        error = %e,
                        "Policy condition failed to evaluate; treating as no match"
                    );
                    false
                }
            })
    }

    /// Evaluate an intent. See [`PolicyEngine::evaluate_context`].
    pub fn evaluate(&self, intent: &ActionIntent, facts: AgentFacts) -> EvaluatorResult {
        let ctx = build_context(intent, facts);
        self.evaluate_context(&intent.action_type, &ctx)
    }

    /// Evaluate a prepared context.
    ///
    /// With no match the result is a neutral ALLOW whose `matched`
    /// metadata is `false`; callers decide what that means.
    pub fn evaluate_context(&self, action_type: &str, ctx: &serde_json::Value) -> EvaluatorResult {
        let Some(policy) = self.find_match(action_type, ctx) else {
            return EvaluatorResult::allow(POLICY_EVALUATOR, "no policy matched")
                .with_metadata("matched", false.into());
        };

        match policy.verdict {
            Verdict::Block => warn!(
                policy = %policy.name,
                action_type = %action_type,
                "Policy BLOCKED action: {}",
                policy.message
            ),
            Verdict::Escalate | Verdict::Defer => info!(
                policy = %policy.name,
                action_type = %action_type,
                escalate_to = ?policy.escalate_to,
                "Policy requires {}: {}",
                policy.verdict,
                policy.message
            ),
            Verdict::Warn => warn!(
                policy = %policy.name,
                action_type = %action_type,
                "Policy WARNING: {}",
                policy.message
            ),
            Verdict::Allow => debug!(
                policy = %policy.name,
                action_type = %action_type,
                "Policy explicitly ALLOWED"
            ),
        }

        let mut result = EvaluatorResult::new(POLICY_EVALUATOR, policy.verdict, policy.message.clone())
            .with_rule(policy.name.clone())
            .with_metadata("matched", true.into());
        if let Some(reviewer) = &policy.escalate_to {
            result = result.with_metadata("escalate_to", reviewer.clone().into());
        }
        result
    }

    /// Dry run: how every policy responds to `intent`.
    pub fn explain(&self, intent: &ActionIntent, facts: AgentFacts) -> Vec<PolicyTrace> {
        let ctx = build_context(intent, facts);
        let mut selected = false;

        self.policies
            .iter()
            .map(|p| {
                let glob_matched = p.matches_action(&intent.action_type);
                let (condition, error) = if glob_matched {
                    match p.condition().evaluate(&ctx) {
                        Ok(hit) => (Some(hit), None),
                        Err(e) => (None, Some(e.to_string())),
                    }
                } else {
                    (None, None)
                };
                let fires = p.enabled && condition == Some(true) && !selected;
                selected |= fires;
                PolicyTrace {
                    policy: p.name.clone(),
                    enabled: p.enabled,
                    glob_matched,
                    condition,
                    error,
                    verdict: p.verdict,
                    selected: fires,
                }
            })
            .collect()
    }

    /// Enabled policies that can never fire because an earlier enabled,
    /// unconditional policy covers all of their globs.
    pub fn shadowed(&self) -> Vec<Shadowed> {
        let mut out = Vec::new();
        for (i, later) in self.policies.iter().enumerate() {
            if !later.enabled {
                continue;
            }
            if let Some(earlier) = self.policies[..i]
                .iter()
                .find(|e| e.enabled && e.is_unconditional() && e.covers(later))
            {
                out.push(Shadowed {
                    policy: later.name.clone(),
                    by: earlier.name.clone(),
                });
            }
        }
        out
    }
}
