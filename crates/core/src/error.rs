//! Error types for the ActionGuard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type.

use thiserror::Error;

/// The top-level error type for all ActionGuard operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Condition language ---
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    // --- Multi-agent ---
    #[error("Cascade violation: {0}")]
    Cascade(#[from] CascadeError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitExceeded),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Deadlines ---
    #[error("Timed out after {millis}ms: {what}")]
    Timeout { what: String, millis: u64 },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// A condition source that does not conform to the grammar.
///
/// Fatal only to the policy that owns the condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at byte {position})")]
pub struct SyntaxError {
    pub message: String,
    pub position: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// A runtime failure while evaluating a compiled condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("unknown context root '{0}'")]
    UnknownRoot(String),

    #[error("cannot compare {left} with {right} using '{op}'")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeError {
    #[error("delegation cycle: agent '{agent_id}' already appears in the instruction chain")]
    Cycle { agent_id: String },

    #[error("delegation depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("orchestrator '{orchestrator}' already has {active} active delegations (max {max})")]
    ConcurrencyExceeded {
        orchestrator: String,
        active: usize,
        max: usize,
    },

    #[error("agent '{from}' is not permitted to delegate to '{to}'")]
    DelegationNotPermitted { from: String, to: String },
}

impl CascadeError {
    /// Short machine-readable kind, used as the rule name on BLOCK results.
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::Cycle { .. } => "cycle",
            CascadeError::DepthExceeded { .. } => "depth_exceeded",
            CascadeError::ConcurrencyExceeded { .. } => "concurrency_exceeded",
            CascadeError::DelegationNotPermitted { .. } => "delegation_not_permitted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("{scope} budget exceeded: {projected:.2} > {limit:.2}")]
    Exceeded {
        scope: String,
        projected: f64,
        limit: f64,
    },

    #[error("invalid cost amount: {0}")]
    InvalidAmount(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for agent '{agent_id}' on tool '{tool}': {limit} calls per {window_secs}s")]
pub struct RateLimitExceeded {
    pub agent_id: String,
    pub tool: String,
    pub limit: usize,
    pub window_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_error_displays_correctly() {
        let err = Error::Cascade(CascadeError::DepthExceeded { depth: 5, max: 4 });
        assert!(err.to_string().contains("depth 5"));
        assert!(err.to_string().contains("maximum 4"));
    }

    #[test]
    fn cascade_kinds_are_stable() {
        assert_eq!(
            CascadeError::Cycle {
                agent_id: "a".into()
            }
            .kind(),
            "cycle"
        );
        assert_eq!(
            CascadeError::ConcurrencyExceeded {
                orchestrator: "o".into(),
                active: 10,
                max: 10
            }
            .kind(),
            "concurrency_exceeded"
        );
    }

    #[test]
    fn syntax_error_reports_position() {
        let err = SyntaxError::new("unexpected token", 7);
        assert_eq!(err.to_string(), "unexpected token (at byte 7)");
    }

    #[test]
    fn rate_limit_error_is_transparent() {
        let err: Error = RateLimitExceeded {
            agent_id: "bot".into(),
            tool: "shell".into(),
            limit: 3,
            window_secs: 60,
        }
        .into();
        assert!(err.to_string().starts_with("rate limit exceeded"));
    }
}
