//! Trust ledger — registered agents, their trust scores and activity.

use actionguard_config::AgentConfig;
use actionguard_core::{InstructionChain, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Trust assumed for an agent the ledger has never seen.
pub const UNREGISTERED_TRUST: f64 = 0.0;

/// One registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct TrustRecord {
    pub agent_id: String,
    /// In [0, 1].
    pub trust_level: f64,
    /// Agents this one may delegate to. Empty means unrestricted.
    pub can_delegate_to: Vec<String>,
    pub max_actions_per_run: Option<u64>,
    pub actions: u64,
    pub blocks: u64,
    pub errors: u64,
    pub registered_at: DateTime<Utc>,
}

impl TrustRecord {
    fn new(agent_id: &str, trust_level: f64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            trust_level: trust_level.clamp(0.0, 1.0),
            can_delegate_to: Vec::new(),
            max_actions_per_run: None,
            actions: 0,
            blocks: 0,
            errors: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn block_rate(&self) -> f64 {
        if self.actions == 0 {
            0.0
        } else {
            self.blocks as f64 / self.actions as f64
        }
    }
}

/// Process-lifetime registry of agent trust.
///
/// Thread-safe via `RwLock`. Reads (trust lookups on every evaluation)
/// vastly outnumber writes (registration, activity counters).
#[derive(Debug, Default)]
pub struct TrustLedger {
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl TrustLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from agent registrations.
    pub fn from_config(agents: &[AgentConfig]) -> Self {
        let ledger = Self::new();
        for agent in agents {
            ledger.register_agent(agent);
        }
        ledger
    }

    /// Register or update an agent's trust score. Activity counters survive
    /// re-registration.
    pub fn register(&self, agent_id: &str, trust_level: f64) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(agent_id.to_string())
            .and_modify(|r| r.trust_level = trust_level.clamp(0.0, 1.0))
            .or_insert_with(|| TrustRecord::new(agent_id, trust_level));
        info!(agent = %agent_id, trust_level, "Agent registered");
    }

    /// Register from configuration, including the allowlist and action cap.
    pub fn register_agent(&self, agent: &AgentConfig) {
        self.register(&agent.id, agent.trust_level.score());
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(&agent.id) {
            record.can_delegate_to = agent.can_delegate_to.clone();
            record.max_actions_per_run = agent.max_actions_per_run;
        }
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id)
            .is_some();
        if removed {
            info!(agent = %agent_id, "Agent unregistered");
        }
        removed
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.read().contains_key(agent_id)
    }

    /// Registered trust, or `None` for an unknown agent.
    pub fn trust_level(&self, agent_id: &str) -> Option<f64> {
        self.read().get(agent_id).map(|r| r.trust_level)
    }

    /// Weakest link across every hop of `chain` plus `caller`.
    ///
    /// Scores come from the ledger, never from the chain's self-reported
    /// values. Unknown agents count as [`UNREGISTERED_TRUST`].
    pub fn effective_trust(&self, chain: &InstructionChain, caller: &str) -> f64 {
        let records = self.read();
        let lookup = |id: &str| records.get(id).map_or(UNREGISTERED_TRUST, |r| r.trust_level);
        chain
            .iter_rev()
            .map(|call| lookup(&call.agent_id))
            .fold(lookup(caller), f64::min)
    }

    /// May `from` hand work to `to`? Unknown senders and empty allowlists
    /// are unrestricted.
    pub fn can_delegate(&self, from: &str, to: &str) -> bool {
        self.read().get(from).is_none_or(|r| {
            r.can_delegate_to.is_empty() || r.can_delegate_to.iter().any(|a| a == to)
        })
    }

    /// Count one decided action for `agent_id`.
    pub fn record_action(&self, agent_id: &str, verdict: Verdict, internal_error: bool) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(agent_id) {
            record.actions += 1;
            if verdict.is_block() {
                record.blocks += 1;
            }
            if internal_error {
                record.errors += 1;
            }
            debug!(
                agent = %agent_id,
                actions = record.actions,
                blocks = record.blocks,
                "Agent activity recorded"
            );
        }
    }

    /// Fraction of this agent's actions that were blocked. 0 when unknown.
    pub fn block_rate(&self, agent_id: &str) -> f64 {
        self.read().get(agent_id).map_or(0.0, TrustRecord::block_rate)
    }

    pub fn action_count(&self, agent_id: &str) -> u64 {
        self.read().get(agent_id).map_or(0, |r| r.actions)
    }

    pub fn max_actions(&self, agent_id: &str) -> Option<u64> {
        self.read().get(agent_id).and_then(|r| r.max_actions_per_run)
    }

    /// Start a new run for `agent_id`: activity counters go back to zero.
    pub fn reset_counters(&self, agent_id: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(agent_id) {
            record.actions = 0;
            record.blocks = 0;
            record.errors = 0;
        }
    }

    pub fn record(&self, agent_id: &str) -> Option<TrustRecord> {
        self.read().get(agent_id).cloned()
    }

    /// All registered agents, sorted by id.
    pub fn agents(&self) -> Vec<TrustRecord> {
        let mut all: Vec<TrustRecord> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TrustRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionguard_config::TrustSpec;
    use actionguard_core::{AgentCall, TrustLevel};

    fn chain(hops: &[(&str, f64)]) -> InstructionChain {
        hops.iter()
            .map(|(id, t)| AgentCall::new(*id, *t, "go"))
            .collect()
    }

    #[test]
    fn register_is_an_upsert() {
        let ledger = TrustLedger::new();
        ledger.register("a", 0.5);
        ledger.record_action("a", Verdict::Block, false);
        ledger.register("a", 0.9);
        assert_eq!(ledger.trust_level("a"), Some(0.9));
        assert_eq!(ledger.action_count("a"), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn trust_is_clamped() {
        let ledger = TrustLedger::new();
        ledger.register("a", 3.0);
        ledger.register("b", -1.0);
        assert_eq!(ledger.trust_level("a"), Some(1.0));
        assert_eq!(ledger.trust_level("b"), Some(0.0));
    }

    #[test]
    fn effective_trust_is_the_weakest_link() {
        let ledger = TrustLedger::new();
        ledger.register("human", 1.0);
        ledger.register("orch", 0.8);
        ledger.register("worker", 0.3);

        let c = chain(&[("human", 1.0), ("orch", 0.8)]);
        assert_eq!(ledger.effective_trust(&c, "worker"), 0.3);
        assert_eq!(ledger.effective_trust(&InstructionChain::new(), "orch"), 0.8);
    }

    #[test]
    fn chain_self_reports_are_ignored() {
        let ledger = TrustLedger::new();
        ledger.register("orch", 0.8);
        ledger.register("worker", 0.8);
        // "rogue" claims full trust but is not registered.
        let c = chain(&[("orch", 0.8), ("rogue", 1.0)]);
        assert_eq!(ledger.effective_trust(&c, "worker"), UNREGISTERED_TRUST);
    }

    #[test]
    fn allowlists() {
        let ledger = TrustLedger::from_config(&[
            AgentConfig {
                id: "orch".into(),
                trust_level: TrustSpec::Named(TrustLevel::Orchestrator),
                can_delegate_to: vec!["writer".into()],
                max_actions_per_run: None,
            },
            AgentConfig {
                id: "writer".into(),
                trust_level: TrustSpec::Score(0.4),
                can_delegate_to: vec![],
                max_actions_per_run: Some(5),
            },
        ]);
        assert!(ledger.can_delegate("orch", "writer"));
        assert!(!ledger.can_delegate("orch", "deleter"));
        assert!(ledger.can_delegate("writer", "anyone"));
        assert!(ledger.can_delegate("stranger", "anyone"));
        assert_eq!(ledger.max_actions("writer"), Some(5));
        assert_eq!(ledger.trust_level("orch"), Some(0.8));
    }

    #[test]
    fn block_rate_tracks_history() {
        let ledger = TrustLedger::new();
        ledger.register("a", 0.5);
        assert_eq!(ledger.block_rate("a"), 0.0);
        ledger.record_action("a", Verdict::Allow, false);
        ledger.record_action("a", Verdict::Block, true);
        ledger.record_action("a", Verdict::Warn, false);
        ledger.record_action("a", Verdict::Block, false);
        assert_eq!(ledger.block_rate("a"), 0.5);
        assert_eq!(ledger.record("a").unwrap().errors, 1);

        ledger.reset_counters("a");
        assert_eq!(ledger.action_count("a"), 0);
    }

    #[test]
    fn unknown_agents_are_not_tracked() {
        let ledger = TrustLedger::new();
        ledger.record_action("ghost", Verdict::Block, false);
        assert_eq!(ledger.block_rate("ghost"), 0.0);
        assert!(!ledger.is_registered("ghost"));
        assert!(!ledger.unregister("ghost"));
    }
}
