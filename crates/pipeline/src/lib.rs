//! # ActionGuard Pipeline
//!
//! The ordered evaluator registry and the [`Guard`] built on top of it.
//!
//! ```ignore
//! let guard = Guard::from_config(&GuardConfig::load(path)?)?;
//!
//! let intent = ActionIntent::new("file.delete", "fs", "agent-1")
//!     .with_parameters(json!({"path": "/tmp/scratch"}));
//! let removed = guard.run(&intent, async { tokio::fs::remove_file("/tmp/scratch").await }).await?;
//! ```
//!
//! [`Guard::run`] only polls the action future for ALLOW and WARN. A BLOCK
//! is refused outright; ESCALATE and DEFER park a [`PendingDecision`] until
//! [`Guard::resolve`] (or an [`Approver`] passed to
//! [`Guard::run_with_approval`]) settles it.

pub mod decision;
pub mod guard;
pub mod metrics;
pub mod pipeline;

pub use decision::{ActionStatus, Decision, ExecutedAction, PendingDecision, Resolution};
pub use guard::{Approver, Explanation, GUARD_EVALUATOR, Guard, GuardBuilder, GuardError, TaskClosure};
pub use metrics::GuardMetrics;
pub use pipeline::{EvaluationPipeline, PipelineOutcome, StageInfo};
