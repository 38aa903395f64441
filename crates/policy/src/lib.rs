//! Policies — declarative rules over proposed agent actions.
//!
//! A policy pairs action-type globs with a condition written in a small,
//! closed expression language. Policies are scanned in declaration order
//! and the first match decides the verdict.
//!
//! # Example Policy
//!
//! ```toml
//! [[policies]]
//! name = "no-system-files"
//! description = "Agents never touch system directories"
//! action_types = ["file.*"]
//! condition = 'parameters.path.startswith("/etc") or is_sensitive_path(parameters.path)'
//! verdict = "BLOCK"
//! message = "Blocked: system paths are off limits"
//! ```
//!
//! # The condition language
//!
//! Conditions compile once, at load time, into a tree that only knows
//! comparisons, `and`/`or`/`not`, dotted paths into the evaluation
//! context, literals, and calls to a fixed table of pure functions
//! ([`functions::BUILTINS`]). Anything else is a [`SyntaxError`]; there
//! is no host evaluator behind it.

mod condition;
mod context;
mod engine;
pub mod functions;
mod model;
mod parser;

pub use condition::{CmpOp, CompiledCondition};
pub use context::{AgentFacts, build_context};
pub use engine::{LoadReport, POLICY_EVALUATOR, PolicyEngine, PolicyTrace, Shadowed};
pub use functions::{contains_pii, is_sensitive_path};
pub use model::Policy;
pub use parser::{MAX_NESTING, MAX_SOURCE_LEN, compile};

use actionguard_core::SyntaxError;

/// Errors that keep a single policy from loading.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid policy '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("condition syntax error in policy '{name}': {source}")]
    Syntax { name: String, source: SyntaxError },

    #[error("invalid action-type glob '{pattern}' in policy '{name}': {reason}")]
    Glob {
        name: String,
        pattern: String,
        reason: String,
    },
}

impl PolicyError {
    /// Name of the policy this error belongs to.
    pub fn policy_name(&self) -> &str {
        match self {
            PolicyError::Invalid { name, .. }
            | PolicyError::Syntax { name, .. }
            | PolicyError::Glob { name, .. } => name,
        }
    }
}
