//! The canonical action intent and its delegation chain.
//!
//! An [`ActionIntent`] is what adapters hand to the guard: one proposed
//! tool invocation, framework independent. Multi-agent provenance rides
//! along as an [`InstructionChain`], a persistent list that is only ever
//! extended, so sibling delegations can share a common prefix without
//! copying or locking.

use crate::verdict::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// One hop in a delegation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    pub agent_id: String,
    /// Trust the delegating side claimed for this agent at the time of the hop.
    /// Informational only; the trust ledger is authoritative.
    #[serde(default)]
    pub trust_level: f64,
    #[serde(default)]
    pub instruction: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AgentCall {
    pub fn new(agent_id: impl Into<String>, trust_level: f64, instruction: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            trust_level,
            instruction: instruction.into(),
            timestamp: Utc::now(),
        }
    }
}

struct Hop {
    call: AgentCall,
    prev: Option<Arc<Hop>>,
}

/// Ordered sequence of delegation hops, root first.
///
/// Cloning is O(1). [`InstructionChain::extend`] returns a new chain that
/// shares every existing hop with its parent.
#[derive(Clone, Default)]
pub struct InstructionChain {
    tail: Option<Arc<Hop>>,
    len: usize,
}

impl InstructionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A new chain with `call` appended. `self` is left untouched.
    pub fn extend(&self, call: AgentCall) -> Self {
        Self {
            tail: Some(Arc::new(Hop {
                call,
                prev: self.tail.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// The most recent hop (the immediate delegator).
    pub fn last(&self) -> Option<&AgentCall> {
        self.tail.as_deref().map(|hop| &hop.call)
    }

    /// The first hop (the orchestrator that started the cascade).
    pub fn root(&self) -> Option<&AgentCall> {
        self.iter_rev().last()
    }

    /// Iterate hops from the most recent back to the root.
    pub fn iter_rev(&self) -> RevIter<'_> {
        RevIter {
            next: self.tail.as_deref(),
        }
    }

    /// Hops in root-first order.
    pub fn calls(&self) -> Vec<&AgentCall> {
        let mut calls: Vec<&AgentCall> = self.iter_rev().collect();
        calls.reverse();
        calls
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.calls().into_iter().map(|c| c.agent_id.as_str()).collect()
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.iter_rev().any(|c| c.agent_id == agent_id)
    }

    /// The first agent id that appears more than once, if any.
    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::with_capacity(self.len);
        self.calls()
            .into_iter()
            .map(|c| c.agent_id.as_str())
            .find(|id| !seen.insert(*id))
    }
}

/// Iterator over chain hops, newest first.
pub struct RevIter<'a> {
    next: Option<&'a Hop>,
}

impl<'a> Iterator for RevIter<'a> {
    type Item = &'a AgentCall;

    fn next(&mut self) -> Option<Self::Item> {
        let hop = self.next?;
        self.next = hop.prev.as_deref();
        Some(&hop.call)
    }
}

impl FromIterator<AgentCall> for InstructionChain {
    fn from_iter<I: IntoIterator<Item = AgentCall>>(iter: I) -> Self {
        iter.into_iter()
            .fold(InstructionChain::new(), |chain, call| chain.extend(call))
    }
}

impl PartialEq for InstructionChain {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter_rev().eq(other.iter_rev())
    }
}

impl fmt::Debug for InstructionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.calls()).finish()
    }
}

impl Serialize for InstructionChain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.calls())
    }
}

impl<'de> Deserialize<'de> for InstructionChain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let calls = Vec::<AgentCall>::deserialize(deserializer)?;
        Ok(calls.into_iter().collect())
    }
}

/// A pending action that an agent wants to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    #[serde(default = "new_action_id")]
    pub action_id: String,

    /// Hierarchical descriptor, e.g. `file.delete`.
    pub action_type: String,

    #[serde(default)]
    pub tool_name: String,

    /// Tool arguments. Expected to be a JSON object.
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,

    pub agent_id: String,

    #[serde(default)]
    pub task_id: Option<String>,

    /// Human-readable description of what the agent is doing.
    #[serde(default)]
    pub task_context: String,

    /// Estimated monetary cost.
    #[serde(default)]
    pub estimated_cost: f64,

    #[serde(default, alias = "risk_hint")]
    pub risk_level: RiskLevel,

    /// Delegation hops that led to this call, excluding `agent_id` itself.
    #[serde(default)]
    pub instruction_chain: InstructionChain,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn new_action_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ActionIntent {
    pub fn new(
        action_type: impl Into<String>,
        tool_name: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            action_id: new_action_id(),
            action_type: action_type.into(),
            tool_name: tool_name.into(),
            parameters: empty_object(),
            agent_id: agent_id.into(),
            task_id: None,
            task_context: String::new(),
            estimated_cost: 0.0,
            risk_level: RiskLevel::default(),
            instruction_chain: InstructionChain::new(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_task_context(mut self, context: impl Into<String>) -> Self {
        self.task_context = context.into();
        self
    }

    pub fn with_cost(mut self, estimated_cost: f64) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_chain(mut self, chain: InstructionChain) -> Self {
        self.instruction_chain = chain;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The chain a delegate of this agent should carry: this intent's chain
    /// plus one hop for `self.agent_id`.
    pub fn delegation_chain(&self, trust_level: f64, instruction: impl Into<String>) -> InstructionChain {
        self.instruction_chain
            .extend(AgentCall::new(self.agent_id.clone(), trust_level, instruction))
    }

    /// Look up a parameter by top-level key.
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }
}
