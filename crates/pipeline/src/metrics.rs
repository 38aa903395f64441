//! Running totals over every decision the guard makes.

use actionguard_core::Verdict;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Distinct agents or action types tracked before new keys are folded
/// into [`OTHER_KEY`].
const MAX_KEYS: usize = 10_000;
const OTHER_KEY: &str = "(other)";

/// Point-in-time view of guard activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardMetrics {
    pub total_actions: u64,
    pub allowed: u64,
    pub warned: u64,
    pub deferred: u64,
    pub escalated: u64,
    pub blocked: u64,
    /// Decisions where some evaluator failed rather than decided.
    pub internal_errors: u64,
    pub approved: u64,
    pub denied: u64,
    pub cancelled: u64,
    pub executed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub total_cost: f64,
    pub avg_risk_score: f64,
    pub avg_duration_us: f64,
    pub by_agent: BTreeMap<String, u64>,
    pub by_action_type: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct Totals {
    metrics: GuardMetrics,
    risk_sum: f64,
    duration_sum: f64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    totals: Mutex<Totals>,
}

pub(crate) enum Outcome {
    Resolved(crate::Resolution),
    Executed { cost: f64 },
    Failed,
    TimedOut,
}

impl MetricsRecorder {
    pub(crate) fn decision(
        &self,
        agent_id: &str,
        action_type: &str,
        verdict: Verdict,
        risk_score: f64,
        duration_us: u64,
        internal_error: bool,
    ) {
        let mut t = self.lock();
        let m = &mut t.metrics;
        m.total_actions += 1;
        match verdict {
            Verdict::Allow => m.allowed += 1,
            Verdict::Warn => m.warned += 1,
            Verdict::Defer => m.deferred += 1,
            Verdict::Escalate => m.escalated += 1,
            Verdict::Block => m.blocked += 1,
        }
        if internal_error {
            m.internal_errors += 1;
        }
        bump(&mut m.by_agent, agent_id);
        bump(&mut m.by_action_type, action_type);

        t.risk_sum += risk_score;
        t.duration_sum += duration_us as f64;
        let n = t.metrics.total_actions as f64;
        t.metrics.avg_risk_score = t.risk_sum / n;
        t.metrics.avg_duration_us = t.duration_sum / n;
    }

    pub(crate) fn outcome(&self, outcome: Outcome) {
        let mut t = self.lock();
        let m = &mut t.metrics;
        match outcome {
            Outcome::Resolved(crate::Resolution::Approve) => m.approved += 1,
            Outcome::Resolved(crate::Resolution::Deny) => m.denied += 1,
            Outcome::Resolved(crate::Resolution::Cancel) => m.cancelled += 1,
            Outcome::Executed { cost } => {
                m.executed += 1;
                m.total_cost += cost;
            }
            Outcome::Failed => m.failed += 1,
            Outcome::TimedOut => m.timed_out += 1,
        }
    }

    pub(crate) fn snapshot(&self) -> GuardMetrics {
        self.lock().metrics.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn bump(counts: &mut BTreeMap<String, u64>, key: &str) {
    if let Some(n) = counts.get_mut(key) {
        *n += 1;
        return;
    }
    let key = if counts.len() >= MAX_KEYS { OTHER_KEY } else { key };
    *counts.entry(key.to_string()).or_insert(0) += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    #[test]
    fn decisions_are_counted_per_verdict() {
        let r = MetricsRecorder::default();
        r.decision("a", "file.read", Verdict::Allow, 0.2, 100, false);
        r.decision("a", "file.delete", Verdict::Block, 0.6, 300, true);
        r.decision("b", "file.read", Verdict::Escalate, 0.4, 200, false);
        r.outcome(Outcome::Resolved(Resolution::Deny));
        r.outcome(Outcome::Executed { cost: 0.5 });

        let m = r.snapshot();
        assert_eq!(m.total_actions, 3);
        assert_eq!((m.allowed, m.blocked, m.escalated), (1, 1, 1));
        assert_eq!(m.internal_errors, 1);
        assert_eq!(m.denied, 1);
        assert_eq!(m.executed, 1);
        assert_eq!(m.total_cost, 0.5);
        assert!((m.avg_risk_score - 0.4).abs() < 1e-9);
        assert_eq!(m.avg_duration_us, 200.0);
        assert_eq!(m.by_agent["a"], 2);
        assert_eq!(m.by_action_type["file.read"], 2);
    }

    #[test]
    fn key_maps_are_bounded() {
        let mut counts = BTreeMap::new();
        for i in 0..MAX_KEYS + 5 {
            bump(&mut counts, &format!("agent-{i}"));
        }
        assert_eq!(counts.len(), MAX_KEYS + 1);
        assert_eq!(counts[OTHER_KEY], 5);
    }
}
