//! What the guard hands back to the execution gate.

use actionguard_core::{EvaluatorResult, Verdict};
use actionguard_multiagent::DelegationPermit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The final decision for one intent.
///
/// Allowed delegated calls carry their [`DelegationPermit`]; the slot stays
/// taken until the decision (or the permit taken from it) is dropped.
#[derive(Debug, Serialize)]
pub struct Decision {
    pub action_id: String,
    pub verdict: Verdict,
    pub reason: String,
    /// Evaluator that produced the verdict.
    pub evaluator: Option<String>,
    /// Rule, policy, or check inside that evaluator.
    pub rule: Option<String>,
    pub confidence: f64,
    pub risk_score: f64,
    pub results: Vec<EvaluatorResult>,
    /// Set for ESCALATE and DEFER.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingDecision>,
    pub duration_us: u64,
    #[serde(skip)]
    permit: Option<DelegationPermit>,
}

impl Decision {
    pub(crate) fn new(action_id: impl Into<String>, verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict,
            reason: reason.into(),
            evaluator: None,
            rule: None,
            confidence: 1.0,
            risk_score: 0.0,
            results: Vec::new(),
            pending: None,
            duration_us: 0,
            permit: None,
        }
    }

    pub(crate) fn with_source(mut self, evaluator: impl Into<String>, rule: Option<String>) -> Self {
        self.evaluator = Some(evaluator.into());
        self.rule = rule;
        self
    }

    pub(crate) fn with_permit(mut self, permit: Option<DelegationPermit>) -> Self {
        self.permit = permit;
        self
    }

    /// ALLOW or WARN.
    pub fn permits_execution(&self) -> bool {
        self.verdict.permits_execution()
    }

    pub fn is_pending(&self) -> bool {
        self.verdict.is_pending()
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    /// Take the delegation slot out, e.g. to hold it across execution.
    pub fn take_permit(&mut self) -> Option<DelegationPermit> {
        self.permit.take()
    }
}

/// A held decision waiting for a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub action_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub action_type: String,
    /// ESCALATE or DEFER.
    pub verdict: Verdict,
    pub reason: String,
    pub evaluator: Option<String>,
    pub rule: Option<String>,
    /// Reviewer named by the deciding policy.
    pub escalate_to: Option<String>,
    pub risk_score: f64,
    pub created_at: DateTime<Utc>,
}

/// How a reviewer settles a [`PendingDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approve,
    Deny,
    Cancel,
}

/// Where an action stands, as far as the guard knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// ALLOW or WARN, not yet executed.
    Allowed,
    Blocked,
    Pending,
    Approved,
    Denied,
    Cancelled,
    Executed,
    Failed,
    TimedOut,
}

impl ActionStatus {
    /// No further transition is possible.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ActionStatus::Blocked
                | ActionStatus::Denied
                | ActionStatus::Cancelled
                | ActionStatus::Executed
                | ActionStatus::Failed
                | ActionStatus::TimedOut
        )
    }
}

/// An action that ran to completion through the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub action_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub action_type: String,
    pub tool_name: String,
    pub cost: f64,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_without_permit() {
        let d = Decision::new("a-1", Verdict::Warn, "flagged")
            .with_source("policy", Some("no-etc".into()));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["verdict"], "WARN");
        assert_eq!(json["rule"], "no-etc");
        assert!(json.get("permit").is_none());
        assert!(json.get("pending").is_none());
        assert!(d.permits_execution());
        assert!(!d.holds_permit());
    }

    #[test]
    fn final_statuses() {
        assert!(ActionStatus::Executed.is_final());
        assert!(!ActionStatus::Pending.is_final());
        assert!(!ActionStatus::Approved.is_final());
        assert_eq!(
            serde_json::to_string(&ActionStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }
}
