//! # ActionGuard Core
//!
//! Domain types, traits, and error definitions for the ActionGuard
//! evaluation pipeline. Every other crate depends inward on this one.
//!
//! ## Design Philosophy
//!
//! The pipeline is assembled from [`Evaluator`] trait objects. Concrete
//! evaluators, the policy language, and the multi-agent state live in
//! their own crates; this crate only fixes the shapes they exchange:
//! [`ActionIntent`] in, [`EvaluatorResult`] out, [`AuditEntry`] for
//! observability.

pub mod audit;
pub mod error;
pub mod evaluator;
pub mod intent;
pub mod verdict;

// Re-export key types at crate root for ergonomics
pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditSink, TracingSink, redact_parameters};
pub use error::{
    BudgetError, CascadeError, Error, EvaluationError, RateLimitExceeded, Result, SyntaxError,
};
pub use evaluator::{Evaluator, EvaluatorResult, FailureMode, ResultOrigin};
pub use intent::{ActionIntent, AgentCall, InstructionChain};
pub use verdict::{RiskLevel, TrustLevel, Verdict};
