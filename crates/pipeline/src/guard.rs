//! The guard — one object that owns the shared multi-agent state, the
//! evaluation pipeline, audit sinks and metrics, and gates execution on
//! the verdicts it hands out.
//!
//! # Flow
//!
//! ```text
//! ActionIntent
//!   → cascade pre-check (cycle, depth, concurrency, allowlist, action cap)
//!   → pipeline (schema → policy → risk → rate limit → budget → approval)
//!   → trust ledger activity, audit entry, metrics
//!   → Decision (ALLOW/WARN run, BLOCK refuses, ESCALATE/DEFER wait)
//! ```

use crate::decision::{ActionStatus, Decision, ExecutedAction, PendingDecision, Resolution};
use crate::metrics::{GuardMetrics, MetricsRecorder, Outcome};
use crate::pipeline::{EvaluationPipeline, PipelineOutcome, StageInfo};
use actionguard_config::{ConfigError, GlobalConfig, GuardConfig};
use actionguard_core::{
    ActionIntent, AuditEntry, AuditLog, AuditSink, CascadeError, Evaluator, TracingSink, Verdict,
    redact_parameters,
};
use actionguard_evaluators::{
    ApprovalGate, BudgetEvaluator, PolicyEvaluator, RateLimiter, RiskScorer, SchemaValidator,
};
use actionguard_multiagent::{
    CascadeController, CascadeLimits, CascadeSummary, DelegationPermit, GlobalBudgetManager,
    TaskBudgetSummary, TrustLedger, UNTRACKED_TASK,
};
use actionguard_policy::{PolicyEngine, PolicyError, PolicyTrace};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Name used on results the guard produces itself.
pub const GUARD_EVALUATOR: &str = "guard";

/// Action statuses remembered before the oldest are forgotten.
const MAX_TRACKED_ACTIONS: usize = 10_000;

/// Why [`Guard::run`] did not produce the action's output.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("action {action_id} refused ({verdict}): {reason}")]
    Refused {
        action_id: String,
        verdict: Verdict,
        reason: String,
    },

    #[error("action {} is waiting for review ({})", .0.action_id, .0.verdict)]
    Pending(Box<PendingDecision>),

    #[error("action {action_id} timed out after {secs}s")]
    Timeout { action_id: String, secs: u64 },

    #[error("action {action_id} failed: {source}")]
    ActionFailed {
        action_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The external human-approval collaborator.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn review(&self, ticket: &PendingDecision) -> Resolution;
}

/// Everything [`Guard::close_task`] tore down.
#[derive(Debug, Clone, Serialize)]
pub struct TaskClosure {
    pub task_id: String,
    pub cascade: Option<CascadeSummary>,
    pub budget: Option<TaskBudgetSummary>,
    pub executed: Vec<ExecutedAction>,
    /// Pending decisions cancelled because their task closed.
    pub cancelled_pending: usize,
}

/// A dry run of one intent through every layer.
#[derive(Debug, Serialize)]
pub struct Explanation {
    pub stages: Vec<StageInfo>,
    /// Set when the cascade pre-check would refuse the intent.
    pub precheck: Option<String>,
    pub outcome: Option<PipelineOutcome>,
    pub policies: Vec<PolicyTrace>,
}

struct PendingEntry {
    ticket: PendingDecision,
    permit: Option<DelegationPermit>,
}

#[derive(Default)]
struct ActionIndex {
    statuses: HashMap<String, ActionStatus>,
    order: VecDeque<String>,
    executed: HashMap<String, Vec<ExecutedAction>>,
}

impl ActionIndex {
    fn set(&mut self, action_id: &str, status: ActionStatus) {
        if self.statuses.insert(action_id.to_string(), status).is_none() {
            self.order.push_back(action_id.to_string());
            while self.order.len() > MAX_TRACKED_ACTIONS {
                if let Some(oldest) = self.order.pop_front() {
                    self.statuses.remove(&oldest);
                }
            }
        }
    }
}

/// Builder for a [`Guard`] with injected evaluators, sinks or state.
pub struct GuardBuilder {
    config: GuardConfig,
    builtins: bool,
    evaluators: Vec<Arc<dyn Evaluator>>,
    sinks: Vec<Arc<dyn AuditSink>>,
    trust: Option<Arc<TrustLedger>>,
}

impl GuardBuilder {
    /// Add a custom evaluator next to (or instead of) the built-in six.
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Share an existing trust ledger instead of building one from the
    /// configured agents.
    pub fn trust_ledger(mut self, trust: Arc<TrustLedger>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Skip the built-in evaluators; only injected ones run.
    pub fn without_builtin_evaluators(mut self) -> Self {
        self.builtins = false;
        self
    }

    pub fn build(self) -> Result<Guard, ConfigError> {
        let config = self.config;
        config.validate()?;

        let trust = self
            .trust
            .unwrap_or_else(|| Arc::new(TrustLedger::from_config(&config.agents)));
        let budget = Arc::new(GlobalBudgetManager::new(config.budget.clone()));
        let cascade = CascadeController::new(CascadeLimits::from(&config.global), Arc::clone(&trust));
        let pipeline = EvaluationPipeline::new();
        let toggles = &config.evaluators;

        let mut policy = None;
        let mut rejected_policies = Vec::new();
        if self.builtins {
            let report = PolicyEngine::load(&config.policies);
            rejected_policies = report.rejected;
            let evaluator = Arc::new(
                PolicyEvaluator::new(
                    report.engine,
                    config.global.default_verdict,
                    Arc::clone(&trust),
                    Arc::clone(&budget),
                )
                .with_settings(&toggles.policy),
            );
            policy = Some(Arc::clone(&evaluator));

            let builtins: [(Arc<dyn Evaluator>, bool); 6] = [
                (
                    Arc::new(SchemaValidator::new().with_settings(&toggles.schema_validator)),
                    toggles.schema_validator.enabled,
                ),
                (evaluator, toggles.policy.enabled),
                (
                    Arc::new(
                        RiskScorer::new(
                            &config.risk,
                            &config.global,
                            Arc::clone(&trust),
                            Arc::clone(&budget),
                        )
                        .with_settings(&toggles.risk_scorer),
                    ),
                    toggles.risk_scorer.enabled,
                ),
                (
                    Arc::new(
                        RateLimiter::from_config(&config.rate_limits)?
                            .with_settings(&toggles.rate_limiter),
                    ),
                    toggles.rate_limiter.enabled,
                ),
                (
                    Arc::new(BudgetEvaluator::new(Arc::clone(&budget)).with_settings(&toggles.budget)),
                    toggles.budget.enabled,
                ),
                (
                    Arc::new(ApprovalGate::new(&config.approval).with_settings(&toggles.approval_gate)),
                    toggles.approval_gate.enabled,
                ),
            ];
            for (evaluator, enabled) in builtins {
                pipeline.add_with(evaluator, enabled);
            }
        }
        for evaluator in self.evaluators {
            let name = evaluator.name().to_string();
            if !pipeline.add(evaluator) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate evaluator name '{name}'"
                )));
            }
        }

        let audit_log = Arc::new(AuditLog::new(config.audit.capacity));
        let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::clone(&audit_log) as Arc<dyn AuditSink>];
        if config.audit.tracing {
            sinks.push(Arc::new(TracingSink));
        }
        sinks.extend(self.sinks);

        info!(
            evaluators = pipeline.len(),
            agents = trust.len(),
            policies = policy.as_ref().map_or(0, |p| p.engine().len()),
            rejected_policies = rejected_policies.len(),
            "Guard ready"
        );

        Ok(Guard {
            global: config.global.clone(),
            trust,
            cascade,
            budget,
            policy,
            pipeline,
            audit_log,
            sinks,
            rejected_policies,
            metrics: MetricsRecorder::default(),
            pending: Mutex::new(HashMap::new()),
            actions: RwLock::new(ActionIndex::default()),
        })
    }
}

/// Evaluates intents and gates their execution.
pub struct Guard {
    global: GlobalConfig,
    trust: Arc<TrustLedger>,
    cascade: CascadeController,
    budget: Arc<GlobalBudgetManager>,
    policy: Option<Arc<PolicyEvaluator>>,
    pipeline: EvaluationPipeline,
    audit_log: Arc<AuditLog>,
    sinks: Vec<Arc<dyn AuditSink>>,
    rejected_policies: Vec<PolicyError>,
    metrics: MetricsRecorder,
    pending: Mutex<HashMap<String, PendingEntry>>,
    actions: RwLock<ActionIndex>,
}

impl Guard {
    pub fn builder(config: GuardConfig) -> GuardBuilder {
        GuardBuilder {
            config,
            builtins: true,
            evaluators: Vec::new(),
            sinks: Vec::new(),
            trust: None,
        }
    }

    /// Build a guard with the six built-in evaluators.
    pub fn from_config(config: &GuardConfig) -> Result<Self, ConfigError> {
        Self::builder(config.clone()).build()
    }

    // --- Accessors ---

    pub fn trust(&self) -> &Arc<TrustLedger> {
        &self.trust
    }

    pub fn budget(&self) -> &Arc<GlobalBudgetManager> {
        &self.budget
    }

    pub fn cascade(&self) -> &CascadeController {
        &self.cascade
    }

    pub fn pipeline(&self) -> &EvaluationPipeline {
        &self.pipeline
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    /// Policies that failed to load when the guard was built.
    pub fn rejected_policies(&self) -> &[PolicyError] {
        &self.rejected_policies
    }

    /// Recompile the policy set in place. Returns the rejected policies.
    pub fn reload_policies(&self, configs: &[actionguard_config::PolicyConfig]) -> Vec<PolicyError> {
        match &self.policy {
            Some(policy) => policy.reload(configs),
            None => Vec::new(),
        }
    }

    pub fn metrics(&self) -> GuardMetrics {
        self.metrics.snapshot()
    }

    // --- Evaluation ---

    /// Decide on `intent`.
    pub fn evaluate(&self, intent: &ActionIntent) -> Decision {
        let started = Instant::now();

        let (outcome, mut decision) = match self.precheck(intent) {
            Err(decision) => (None, decision),
            Ok(permit) => {
                let outcome = self.pipeline.run(intent);
                let decision = decide(intent, &outcome).with_permit(permit);
                (Some(outcome), decision)
            }
        };
        decision.duration_us = started.elapsed().as_micros() as u64;

        let internal_error = outcome.as_ref().is_some_and(PipelineOutcome::has_internal_error);
        self.trust
            .record_action(&intent.agent_id, decision.verdict, internal_error);
        self.emit_audit(intent, &decision, outcome.as_ref());
        self.metrics.decision(
            &intent.agent_id,
            &intent.action_type,
            decision.verdict,
            decision.risk_score,
            decision.duration_us,
            internal_error,
        );

        let status = match decision.verdict {
            Verdict::Allow | Verdict::Warn => ActionStatus::Allowed,
            Verdict::Block => ActionStatus::Blocked,
            Verdict::Escalate | Verdict::Defer => ActionStatus::Pending,
        };
        self.set_status(&intent.action_id, status);

        match decision.verdict {
            Verdict::Block => {
                // Nothing will run; free the slot now.
                drop(decision.take_permit());
            }
            Verdict::Escalate | Verdict::Defer => {
                let ticket = pending_ticket(intent, &decision, outcome.as_ref());
                info!(
                    action_id = %intent.action_id,
                    agent = %intent.agent_id,
                    verdict = %decision.verdict,
                    escalate_to = ?ticket.escalate_to,
                    "Decision held for review"
                );
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
                    intent.action_id.clone(),
                    PendingEntry {
                        ticket: ticket.clone(),
                        permit: decision.take_permit(),
                    },
                );
                decision.pending = Some(ticket);
            }
            Verdict::Allow | Verdict::Warn => {}
        }
        decision
    }

    /// [`Guard::evaluate`] on the blocking pool, under the configured
    /// evaluation deadline. A missed deadline is a BLOCK.
    ///
    /// The late evaluation still finishes in the background. Once it does,
    /// the action is marked timed out and a BLOCK audit entry follows its
    /// own, so the last word on the action id matches what was returned.
    pub async fn evaluate_async(self: &Arc<Self>, intent: ActionIntent) -> Decision {
        let action_id = intent.action_id.clone();
        let late_intent = intent.clone();
        let guard = Arc::clone(self);
        let mut handle = tokio::task::spawn_blocking(move || guard.evaluate(&intent));

        let deadline = self.global.evaluation_timeout_ms;
        let joined = if deadline == 0 {
            (&mut handle).await
        } else {
            match tokio::time::timeout(Duration::from_millis(deadline), &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(action_id = %action_id, deadline_ms = deadline, "Evaluation deadline missed");
                    let timed_out = deadline_missed(&action_id, deadline);
                    self.set_status(&timed_out.action_id, ActionStatus::TimedOut);
                    self.metrics.outcome(Outcome::TimedOut);

                    let guard = Arc::clone(self);
                    let record = deadline_missed(&action_id, deadline);
                    tokio::spawn(async move {
                        if let Ok(mut late) = handle.await {
                            if late.is_pending() {
                                guard.resolve(&late.action_id, Resolution::Cancel);
                            }
                            // Nothing will run on the late decision.
                            drop(late.take_permit());
                        }
                        guard.set_status(&record.action_id, ActionStatus::TimedOut);
                        guard.emit_audit(&late_intent, &record, None);
                        debug!(action_id = %record.action_id, "Late evaluation reconciled");
                    });
                    return timed_out;
                }
            }
        };

        joined.unwrap_or_else(|e| {
            error!(action_id = %action_id, error = %e, "Evaluation task failed");
            Decision::new(action_id, Verdict::Block, format!("evaluation task failed: {e}"))
                .with_source(GUARD_EVALUATOR, Some("evaluation.failed".into()))
        })
    }

    /// Dry run: cascade outcome, pipeline results and the policy trace.
    ///
    /// Nothing is recorded. No delegation slot or rate-limit slot is taken,
    /// no cascade task is opened, and the ledger, audit sinks and metrics
    /// stay as they were.
    pub fn explain(&self, intent: &ActionIntent) -> Explanation {
        let checked = self
            .cascade
            .preview(intent)
            .map_err(|e| cascade_refusal(intent, &e))
            .and_then(|()| self.action_cap(intent));
        let (precheck, outcome) = match checked {
            Err(decision) => (Some(decision.reason), None),
            Ok(()) => (None, Some(self.pipeline.preview(intent))),
        };
        Explanation {
            stages: self.pipeline.stages(),
            precheck,
            outcome,
            policies: self
                .policy
                .as_ref()
                .map(|p| p.explain(intent))
                .unwrap_or_default(),
        }
    }

    /// Cascade limits and the per-run action cap, before any evaluator.
    fn precheck(&self, intent: &ActionIntent) -> Result<Option<DelegationPermit>, Decision> {
        let permit = self
            .cascade
            .check(intent)
            .map_err(|e| cascade_refusal(intent, &e))?;
        self.action_cap(intent)?;
        Ok(permit)
    }

    fn action_cap(&self, intent: &ActionIntent) -> Result<(), Decision> {
        if let Some(max) = self.trust.max_actions(&intent.agent_id) {
            let used = self.trust.action_count(&intent.agent_id);
            if used >= max {
                warn!(agent = %intent.agent_id, used, max, "Action cap reached");
                return Err(Decision::new(
                    &intent.action_id,
                    Verdict::Block,
                    format!(
                        "agent '{}' reached its limit of {max} actions per run",
                        intent.agent_id
                    ),
                )
                .with_source(GUARD_EVALUATOR, Some("cascade.max_actions".into())));
            }
        }
        Ok(())
    }

    fn emit_audit(&self, intent: &ActionIntent, decision: &Decision, outcome: Option<&PipelineOutcome>) {
        let entry = AuditEntry {
            action_id: intent.action_id.clone(),
            agent_id: intent.agent_id.clone(),
            task_id: intent.task_id.clone(),
            action_type: intent.action_type.clone(),
            verdict: decision.verdict,
            risk_score: decision.risk_score,
            triggered_by: decision.rule.clone().or_else(|| decision.evaluator.clone()),
            evaluator_results: outcome.map(|o| o.results.clone()).unwrap_or_default(),
            instruction_chain: intent.instruction_chain.clone(),
            parameters: redact_parameters(&intent.parameters),
            duration_us: decision.duration_us,
            timestamp: Utc::now(),
            error: None,
        };
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    // --- Resolution ---

    /// Settle a held decision. `None` when `action_id` is not pending.
    ///
    /// Approve returns an ALLOW decision carrying the held permit; Deny
    /// and Cancel release it.
    pub fn resolve(&self, action_id: &str, resolution: Resolution) -> Option<Decision> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(action_id)?;
        let ticket = entry.ticket;
        info!(
            action_id = %action_id,
            agent = %ticket.agent_id,
            resolution = ?resolution,
            "Pending decision resolved"
        );
        self.metrics.outcome(Outcome::Resolved(resolution));

        let (verdict, reason, status) = match resolution {
            Resolution::Approve => (Verdict::Allow, "approved by reviewer", ActionStatus::Approved),
            Resolution::Deny => (Verdict::Block, "denied by reviewer", ActionStatus::Denied),
            Resolution::Cancel => (Verdict::Block, "cancelled before review", ActionStatus::Cancelled),
        };
        self.set_status(action_id, status);

        let mut decision = Decision::new(action_id, verdict, reason)
            .with_source(
                ticket.evaluator.clone().unwrap_or_else(|| GUARD_EVALUATOR.into()),
                ticket.rule.clone(),
            );
        decision.risk_score = ticket.risk_score;
        if resolution == Resolution::Approve {
            decision = decision.with_permit(entry.permit);
        }
        Some(decision)
    }

    /// Decisions currently waiting for review, oldest first.
    pub fn pending_decisions(&self) -> Vec<PendingDecision> {
        let mut all: Vec<PendingDecision> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.ticket.clone())
            .collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    // --- Execution ---

    /// Evaluate `intent` and run `action` only on ALLOW or WARN.
    pub async fn run<T, E, F>(&self, intent: &ActionIntent, action: F) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let decision = self.evaluate(intent);
        if let Some(ticket) = decision.pending {
            return Err(GuardError::Pending(Box::new(ticket)));
        }
        self.execute(intent, decision, action).await
    }

    /// Like [`Guard::run`], but held decisions go to `approver` first.
    ///
    /// A review that outlasts the action timeout counts as cancelled.
    pub async fn run_with_approval<T, E, F>(
        &self,
        intent: &ActionIntent,
        approver: &dyn Approver,
        action: F,
    ) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut decision = self.evaluate(intent);
        if let Some(ticket) = decision.pending.take() {
            let resolution = tokio::time::timeout(self.action_timeout(), approver.review(&ticket))
                .await
                .unwrap_or_else(|_| {
                    warn!(action_id = %ticket.action_id, "Review timed out");
                    Resolution::Cancel
                });
            match self.resolve(&ticket.action_id, resolution) {
                Some(resolved) => decision = resolved,
                None => {
                    return Err(GuardError::Refused {
                        action_id: ticket.action_id,
                        verdict: Verdict::Block,
                        reason: "decision was resolved elsewhere".into(),
                    });
                }
            }
        }
        self.execute(intent, decision, action).await
    }

    async fn execute<T, E, F>(&self, intent: &ActionIntent, mut decision: Decision, action: F) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !decision.permits_execution() {
            return Err(GuardError::Refused {
                action_id: decision.action_id,
                verdict: decision.verdict,
                reason: decision.reason,
            });
        }
        // Held until the action settles, whichever way.
        let _permit = decision.take_permit();
        let timeout = self.action_timeout();

        match tokio::time::timeout(timeout, action).await {
            Err(_) => {
                warn!(action_id = %intent.action_id, timeout_secs = timeout.as_secs(), "Action timed out");
                self.set_status(&intent.action_id, ActionStatus::TimedOut);
                self.metrics.outcome(Outcome::TimedOut);
                Err(GuardError::Timeout {
                    action_id: intent.action_id.clone(),
                    secs: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                let source: Box<dyn std::error::Error + Send + Sync> = e.into();
                error!(action_id = %intent.action_id, action_type = %intent.action_type, error = %source, "Action failed");
                self.set_status(&intent.action_id, ActionStatus::Failed);
                self.metrics.outcome(Outcome::Failed);
                Err(GuardError::ActionFailed {
                    action_id: intent.action_id.clone(),
                    source,
                })
            }
            Ok(Ok(value)) => {
                self.record_execution(intent);
                Ok(value)
            }
        }
    }

    fn record_execution(&self, intent: &ActionIntent) {
        let task = intent.task_id.as_deref().unwrap_or(UNTRACKED_TASK);
        let cost = if intent.estimated_cost.is_finite() {
            intent.estimated_cost.max(0.0)
        } else {
            0.0
        };
        if let Err(e) = self.budget.add_cost(task, &intent.agent_id, cost) {
            warn!(action_id = %intent.action_id, task = %task, error = %e, "Cost not recorded");
        }
        self.metrics.outcome(Outcome::Executed { cost });

        let mut actions = self.actions.write().unwrap_or_else(|e| e.into_inner());
        actions.set(&intent.action_id, ActionStatus::Executed);
        actions
            .executed
            .entry(task.to_string())
            .or_default()
            .push(ExecutedAction {
                action_id: intent.action_id.clone(),
                agent_id: intent.agent_id.clone(),
                task_id: intent.task_id.clone(),
                action_type: intent.action_type.clone(),
                tool_name: intent.tool_name.clone(),
                cost,
                executed_at: Utc::now(),
            });
        debug!(action_id = %intent.action_id, task = %task, cost, "Action executed");
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.global.action_timeout_secs)
    }

    // --- Lookups for rollback ---

    pub fn action_status(&self, action_id: &str) -> Option<ActionStatus> {
        self.read_actions().statuses.get(action_id).copied()
    }

    pub fn was_executed(&self, action_id: &str) -> bool {
        self.action_status(action_id) == Some(ActionStatus::Executed)
    }

    /// Actions executed for `task_id`, in execution order.
    pub fn executed_actions(&self, task_id: &str) -> Vec<ExecutedAction> {
        self.read_actions()
            .executed
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Close a task everywhere: cascade state, budget ledger, executed
    /// index and any decisions still held for it.
    pub fn close_task(&self, task_id: &str) -> TaskClosure {
        let held: Vec<String> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.ticket.task_id.as_deref().unwrap_or(UNTRACKED_TASK) == task_id)
            .map(|e| e.ticket.action_id.clone())
            .collect();
        let cancelled_pending = held
            .iter()
            .filter(|id| self.resolve(id, Resolution::Cancel).is_some())
            .count();

        let closure = TaskClosure {
            task_id: task_id.to_string(),
            cascade: self.cascade.close_task(task_id),
            budget: self.budget.close_task(task_id),
            executed: self
                .actions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .executed
                .remove(task_id)
                .unwrap_or_default(),
            cancelled_pending,
        };
        info!(
            task = %task_id,
            executed = closure.executed.len(),
            cancelled_pending,
            "Task closed"
        );
        closure
    }

    fn set_status(&self, action_id: &str, status: ActionStatus) {
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(action_id, status);
    }

    fn read_actions(&self) -> std::sync::RwLockReadGuard<'_, ActionIndex> {
        self.actions.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn cascade_refusal(intent: &ActionIntent, error: &CascadeError) -> Decision {
    Decision::new(&intent.action_id, Verdict::Block, error.to_string())
        .with_source(GUARD_EVALUATOR, Some(format!("cascade.{}", error.kind())))
}

fn deadline_missed(action_id: &str, deadline_ms: u64) -> Decision {
    Decision::new(
        action_id,
        Verdict::Block,
        format!("evaluation exceeded its {deadline_ms}ms deadline"),
    )
    .with_source(GUARD_EVALUATOR, Some("evaluation.timeout".into()))
}

/// Turn a pipeline outcome into a decision.
fn decide(intent: &ActionIntent, outcome: &PipelineOutcome) -> Decision {
    let mut decision = match (outcome.verdict, outcome.decisive_result()) {
        (Verdict::Allow, _) | (_, None) => Decision::new(
            &intent.action_id,
            outcome.verdict,
            "all evaluators passed",
        ),
        (verdict, Some(r)) => {
            let mut d = Decision::new(&intent.action_id, verdict, r.reason.clone())
                .with_source(r.evaluator_name.clone(), r.rule.clone());
            d.confidence = r.confidence;
            d
        }
    };
    decision.risk_score = outcome.risk_score();
    decision.results = outcome.results.clone();
    decision
}

fn pending_ticket(intent: &ActionIntent, decision: &Decision, outcome: Option<&PipelineOutcome>) -> PendingDecision {
    let escalate_to = outcome
        .and_then(PipelineOutcome::decisive_result)
        .and_then(|r| r.metadata.get("escalate_to"))
        .and_then(|v| v.as_str())
        .map(String::from);
    PendingDecision {
        action_id: intent.action_id.clone(),
        agent_id: intent.agent_id.clone(),
        task_id: intent.task_id.clone(),
        action_type: intent.action_type.clone(),
        verdict: decision.verdict,
        reason: decision.reason.clone(),
        evaluator: decision.evaluator.clone(),
        rule: decision.rule.clone(),
        escalate_to,
        risk_score: decision.risk_score,
        created_at: Utc::now(),
    }
}
