//! The evaluation context conditions are resolved against.
//!
//! Roots: `action_type`, `tool_name`, `parameters`, `estimated_cost`,
//! `risk_level`, `task_context`, `agent`, `task`, `chain`, `metadata`.
//! A path whose first segment is not one of these is an evaluation error.

use actionguard_core::ActionIntent;
use serde_json::{Value, json};

/// Facts about the calling agent that live outside the intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentFacts {
    pub trust_level: f64,
    pub action_count: u64,
    pub task_spent: f64,
}

/// Build the context object for `intent`.
pub fn build_context(intent: &ActionIntent, facts: AgentFacts) -> Value {
    let chain = &intent.instruction_chain;
    json!({
        "action_type": intent.action_type,
        "tool_name": intent.tool_name,
        "parameters": intent.parameters,
        "estimated_cost": intent.estimated_cost,
        "risk_level": intent.risk_level.as_str(),
        "task_context": intent.task_context,
        "agent": {
            "id": intent.agent_id,
            "trust_level": facts.trust_level,
            "action_count": facts.action_count,
        },
        "task": {
            "id": intent.task_id,
            "spent": facts.task_spent,
        },
        "chain": {
            "depth": chain.len(),
            "agents": chain.agent_ids(),
            "root": chain.root().map(|c| c.agent_id.as_str()),
        },
        "metadata": intent.metadata,
    })
}
