//! # ActionGuard Multi-Agent
//!
//! Shared state that spans more than one agent:
//!
//! - [`TrustLedger`] — who is registered and how far each agent is trusted
//! - [`CascadeController`] — delegation cycle, depth and concurrency limits
//! - [`GlobalBudgetManager`] — task-wide spend and budget-gaming detection
//!
//! All three are `Send + Sync` and meant to be shared behind an `Arc`.

pub mod budget;
pub mod cascade;
pub mod trust;

pub use budget::{BudgetStatus, GlobalBudgetManager, TaskBudgetSummary};
pub use cascade::{CascadeController, CascadeLimits, CascadeSummary, DelegationPermit, UNTRACKED_TASK};
pub use trust::{TrustLedger, TrustRecord, UNREGISTERED_TRUST};
