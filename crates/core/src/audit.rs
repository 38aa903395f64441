//! Audit records — one structured entry per evaluated action.
//!
//! The core builds entries and hands them to [`AuditSink`]s. Where the
//! entries end up (files, telemetry, webhooks) is up to the sink.

use crate::evaluator::EvaluatorResult;
use crate::intent::InstructionChain;
use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub action_type: String,
    pub verdict: Verdict,
    pub risk_score: f64,
    /// Rule or evaluator that decided the verdict.
    #[serde(default)]
    pub triggered_by: Option<String>,
    pub evaluator_results: Vec<EvaluatorResult>,
    pub instruction_chain: InstructionChain,
    /// Parameters with credential-like keys redacted.
    pub parameters: serde_json::Value,
    pub duration_us: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditEntry {
    /// True when any evaluator result came from a failure mode rather
    /// than a genuine decision.
    pub fn has_internal_error(&self) -> bool {
        self.evaluator_results
            .iter()
            .any(|r| r.origin.is_internal_error())
    }
}

/// Trait for audit log sinks (where entries are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Keys whose values never reach an audit sink.
const REDACTED_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "private_key",
    "access_token",
    "refresh_token",
    "auth",
];

const REDACTED: &str = "[REDACTED]";

/// Return a copy of `params` with credential-like keys replaced.
pub fn redact_parameters(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_ascii_lowercase();
                    if REDACTED_KEYS.iter().any(|needle| lower.contains(needle)) {
                        (k.clone(), serde_json::Value::String(REDACTED.into()))
                    } else {
                        (k.clone(), redact_parameters(v))
                    }
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_parameters).collect())
        }
        other => other.clone(),
    }
}

/// Filter criteria for querying an [`AuditLog`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub verdict: Option<Verdict>,
    pub action_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Maximum entries returned, newest last. `0` means unlimited.
    pub limit: usize,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.agent_id.as_deref().is_none_or(|a| a == entry.agent_id)
            && self
                .task_id
                .as_deref()
                .is_none_or(|t| entry.task_id.as_deref() == Some(t))
            && self.verdict.is_none_or(|v| v == entry.verdict)
            && self
                .action_type
                .as_deref()
                .is_none_or(|t| t == entry.action_type)
            && self.since.is_none_or(|s| entry.timestamp >= s)
    }
}

/// Default number of entries kept by [`AuditLog`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Bounded in-memory audit log. Oldest entries are evicted first.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entry_count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if filter.limit > 0 && hits.len() > filter.limit {
            hits.drain(..hits.len() - filter.limit);
        }
        hits
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.query(&AuditFilter::default())
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl AuditSink for AuditLog {
    fn record(&self, entry: &AuditEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            target: "actionguard::audit",
            action_id = %entry.action_id,
            agent = %entry.agent_id,
            task = ?entry.task_id,
            action_type = %entry.action_type,
            verdict = %entry.verdict,
            risk_score = entry.risk_score,
            triggered_by = ?entry.triggered_by,
            chain_depth = entry.instruction_chain.len(),
            duration_us = entry.duration_us,
            internal_error = entry.has_internal_error(),
            "AUDIT"
        );
    }
}
