//! The evaluation pipeline — an ordered, mutable registry of evaluators.
//!
//! A run takes a snapshot of the registry (an `Arc` clone) and works on
//! that, so registry changes never disturb a run already under way.

use actionguard_core::{ActionIntent, Evaluator, EvaluatorResult, FailureMode, Verdict};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

#[derive(Clone)]
struct Slot {
    evaluator: Arc<dyn Evaluator>,
    priority: i32,
    enabled: bool,
    /// Insertion sequence, breaks priority ties.
    seq: u64,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    next_seq: u64,
}

impl Registry {
    fn sort(&mut self) {
        self.slots.sort_by_key(|s| (s.priority, s.seq));
    }
}

/// One registered stage as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub failure_mode: FailureMode,
}

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    /// Most restrictive verdict observed.
    pub verdict: Verdict,
    /// Results in invocation order.
    pub results: Vec<EvaluatorResult>,
    /// Index into `results` of the first result carrying `verdict`.
    pub decisive: Option<usize>,
    /// A BLOCK or pending verdict stopped the run early.
    pub stopped_early: bool,
}

impl PipelineOutcome {
    pub fn decisive_result(&self) -> Option<&EvaluatorResult> {
        self.decisive.and_then(|i| self.results.get(i))
    }

    /// Highest risk score any evaluator reported.
    pub fn risk_score(&self) -> f64 {
        self.results
            .iter()
            .filter_map(|r| r.risk_score)
            .fold(0.0, f64::max)
    }

    pub fn has_internal_error(&self) -> bool {
        self.results.iter().any(|r| r.origin.is_internal_error())
    }
}

/// Evaluators run in priority order; the most restrictive verdict wins.
#[derive(Default)]
pub struct EvaluationPipeline {
    registry: RwLock<Arc<Registry>>,
}

impl EvaluationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator at its own priority. Returns `false` (and
    /// changes nothing) when the name is already taken.
    pub fn add(&self, evaluator: Arc<dyn Evaluator>) -> bool {
        self.add_with(evaluator, true)
    }

    /// Register an evaluator, possibly disabled.
    pub fn add_with(&self, evaluator: Arc<dyn Evaluator>, enabled: bool) -> bool {
        let name = evaluator.name().to_string();
        let added = self.mutate(|reg| {
            if reg.slots.iter().any(|s| s.evaluator.name() == name) {
                return false;
            }
            let seq = reg.next_seq;
            reg.next_seq += 1;
            reg.slots.push(Slot {
                priority: evaluator.priority(),
                evaluator,
                enabled,
                seq,
            });
            true
        });
        if added {
            debug!(evaluator = %name, enabled, "Evaluator registered");
        }
        added
    }

    pub fn remove(&self, name: &str) -> bool {
        self.mutate(|reg| {
            let before = reg.slots.len();
            reg.slots.retain(|s| s.evaluator.name() != name);
            reg.slots.len() != before
        })
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        self.mutate(|reg| match reg.slots.iter_mut().find(|s| s.evaluator.name() == name) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        })
    }

    pub fn set_priority(&self, name: &str, priority: i32) -> bool {
        self.mutate(|reg| match reg.slots.iter_mut().find(|s| s.evaluator.name() == name) {
            Some(slot) => {
                slot.priority = priority;
                true
            }
            None => false,
        })
    }

    /// Registered stages in run order.
    pub fn stages(&self) -> Vec<StageInfo> {
        self.snapshot()
            .slots
            .iter()
            .map(|s| StageInfo {
                name: s.evaluator.name().to_string(),
                priority: s.priority,
                enabled: s.enabled,
                failure_mode: s.evaluator.failure_mode(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every enabled evaluator against `intent`.
    ///
    /// BLOCK stops the run. ESCALATE and DEFER stop it too, returning the
    /// pending verdict with the results so far. WARN and ALLOW continue.
    pub fn run(&self, intent: &ActionIntent) -> PipelineOutcome {
        self.walk(intent, false)
    }

    /// [`run`](Self::run) through each evaluator's preview: the same
    /// verdicts, with no rate window or other evaluator state touched.
    pub fn preview(&self, intent: &ActionIntent) -> PipelineOutcome {
        self.walk(intent, true)
    }

    fn walk(&self, intent: &ActionIntent, dry_run: bool) -> PipelineOutcome {
        let registry = self.snapshot();
        let mut outcome = PipelineOutcome {
            verdict: Verdict::Allow,
            results: Vec::with_capacity(registry.slots.len()),
            decisive: None,
            stopped_early: false,
        };

        for slot in registry.slots.iter().filter(|s| s.enabled) {
            let result = invoke(slot.evaluator.as_ref(), intent, dry_run);
            debug!(
                evaluator = %result.evaluator_name,
                verdict = %result.verdict,
                action_id = %intent.action_id,
                "Evaluator finished"
            );

            let verdict = result.verdict;
            if outcome.decisive.is_none() || verdict > outcome.verdict {
                outcome.verdict = verdict;
                outcome.decisive = Some(outcome.results.len());
            }
            outcome.results.push(result);

            if verdict.is_block() || verdict.is_pending() {
                outcome.stopped_early = true;
                break;
            }
        }
        outcome
    }

    fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Copy, change, swap.
    fn mutate<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let mut guard = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Registry {
            slots: guard.slots.clone(),
            next_seq: guard.next_seq,
        };
        let out = f(&mut next);
        next.sort();
        *guard = Arc::new(next);
        out
    }
}

/// Call one evaluator, turning errors and panics into failure-mode results.
fn invoke(evaluator: &dyn Evaluator, intent: &ActionIntent, dry_run: bool) -> EvaluatorResult {
    let name = evaluator.name();
    let mode = evaluator.failure_mode();
    let call = || {
        if dry_run {
            evaluator.preview(intent)
        } else {
            evaluator.evaluate(intent)
        }
    };
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(
                evaluator = %name,
                action_id = %intent.action_id,
                failure_mode = ?mode,
                error = %e,
                "Evaluator failed"
            );
            EvaluatorResult::from_failure(name, mode, &e.to_string())
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                evaluator = %name,
                action_id = %intent.action_id,
                failure_mode = ?mode,
                panic = %message,
                "Evaluator panicked"
            );
            EvaluatorResult::from_failure(name, mode, &format!("panic: {message}"))
        }
    }
}
