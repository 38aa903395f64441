//! Verdicts, risk classes, and named trust levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The decision rendered for a single action.
///
/// Variants are declared from least to most restrictive so the derived
/// `Ord` gives `BLOCK > ESCALATE > DEFER > WARN > ALLOW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Proceed.
    Allow,
    /// Proceed, but flag for review.
    Warn,
    /// Hold the action until an external collaborator resumes it.
    Defer,
    /// Hold the action pending human approval.
    Escalate,
    /// Refuse the action.
    Block,
}

impl Verdict {
    /// Whether the gate may invoke the underlying action.
    pub fn permits_execution(self) -> bool {
        matches!(self, Verdict::Allow | Verdict::Warn)
    }

    /// Whether the decision is suspended awaiting resolution.
    pub fn is_pending(self) -> bool {
        matches!(self, Verdict::Escalate | Verdict::Defer)
    }

    pub fn is_block(self) -> bool {
        self == Verdict::Block
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Warn => "WARN",
            Verdict::Defer => "DEFER",
            Verdict::Escalate => "ESCALATE",
            Verdict::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(Verdict::Allow),
            "WARN" => Ok(Verdict::Warn),
            "DEFER" => Ok(Verdict::Defer),
            "ESCALATE" => Ok(Verdict::Escalate),
            "BLOCK" | "DENY" => Ok(Verdict::Block),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

/// Pre-declared risk classification carried on an intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Base score used as a floor for the severity signal.
    pub fn base_score(self) -> f64 {
        match self {
            RiskLevel::Low => 0.1,
            RiskLevel::Medium => 0.3,
            RiskLevel::High => 0.6,
            RiskLevel::Critical => 0.9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named trust tiers for agent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Human,
    Orchestrator,
    Peer,
    SubAgent,
    Unknown,
}

impl TrustLevel {
    pub fn score(self) -> f64 {
        match self {
            TrustLevel::Human => 1.0,
            TrustLevel::Orchestrator => 0.8,
            TrustLevel::Peer => 0.5,
            TrustLevel::SubAgent => 0.3,
            TrustLevel::Unknown => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_are_ordered_by_restrictiveness() {
        let mut all = vec![
            Verdict::Block,
            Verdict::Allow,
            Verdict::Escalate,
            Verdict::Warn,
            Verdict::Defer,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                Verdict::Allow,
                Verdict::Warn,
                Verdict::Defer,
                Verdict::Escalate,
                Verdict::Block
            ]
        );
        assert_eq!(Verdict::Warn.max(Verdict::Escalate), Verdict::Escalate);
    }

    #[test]
    fn verdict_serializes_uppercase() {
        let json = serde_json::to_string(&Verdict::Escalate).unwrap();
        assert_eq!(json, "\"ESCALATE\"");
        let back: Verdict = serde_json::from_str("\"BLOCK\"").unwrap();
        assert_eq!(back, Verdict::Block);
    }

    #[test]
    fn verdict_parses_case_insensitively() {
        assert_eq!("warn".parse::<Verdict>().unwrap(), Verdict::Warn);
        assert_eq!("deny".parse::<Verdict>().unwrap(), Verdict::Block);
        assert!("maybe".parse::<Verdict>().is_err());
    }

    #[test]
    fn pending_and_execution_classes() {
        assert!(Verdict::Allow.permits_execution());
        assert!(Verdict::Warn.permits_execution());
        assert!(!Verdict::Defer.permits_execution());
        assert!(Verdict::Defer.is_pending());
        assert!(Verdict::Escalate.is_pending());
        assert!(!Verdict::Block.is_pending());
    }

    #[test]
    fn risk_levels_have_base_scores() {
        assert!((RiskLevel::Critical.base_score() - 0.9).abs() < f64::EPSILON);
        assert_eq!(RiskLevel::default(), RiskLevel::Medium);
    }

    #[test]
    fn named_trust_levels() {
        assert!((TrustLevel::Orchestrator.score() - 0.8).abs() < f64::EPSILON);
        assert_eq!(TrustLevel::Unknown.score(), 0.0);
    }
}
