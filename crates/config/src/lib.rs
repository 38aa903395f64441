//! Configuration loading, validation, and management for ActionGuard.
//!
//! A guard is built from one immutable [`GuardConfig`] snapshot, usually
//! read from `actionguard.toml`. Hot-reload means loading a new snapshot
//! and building a new guard; nothing here is watched or mutated live.

use actionguard_core::{FailureMode, RiskLevel, TrustLevel, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Ordered policy declarations. First match wins.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Agent registrations for the trust ledger.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Per-evaluator toggles and failure modes.
    #[serde(default)]
    pub evaluators: EvaluatorToggles,

    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Verdict applied when no policy matches.
    #[serde(default = "default_verdict")]
    pub default_verdict: Verdict,

    /// Base risk threshold, scaled by effective trust.
    #[serde(default = "default_max_risk_score")]
    pub max_risk_score: f64,

    /// Verdict when the risk score exceeds the effective threshold.
    #[serde(default = "default_on_risk_exceeded")]
    pub on_risk_exceeded: Verdict,

    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,

    #[serde(default = "default_max_concurrent_delegations")]
    pub max_concurrent_delegations: usize,

    /// Deadline for one async evaluation, in milliseconds. 0 disables it.
    #[serde(default = "default_evaluation_timeout_ms")]
    pub evaluation_timeout_ms: u64,

    /// Deadline for executing an allowed action through the guard.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

fn default_verdict() -> Verdict {
    Verdict::Allow
}
fn default_max_risk_score() -> f64 {
    0.85
}
fn default_on_risk_exceeded() -> Verdict {
    Verdict::Block
}
fn default_max_delegation_depth() -> usize {
    4
}
fn default_max_concurrent_delegations() -> usize {
    10
}
fn default_evaluation_timeout_ms() -> u64 {
    250
}
fn default_action_timeout_secs() -> u64 {
    300
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_verdict: default_verdict(),
            max_risk_score: default_max_risk_score(),
            on_risk_exceeded: default_on_risk_exceeded(),
            max_delegation_depth: default_max_delegation_depth(),
            max_concurrent_delegations: default_max_concurrent_delegations(),
            evaluation_timeout_ms: default_evaluation_timeout_ms(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_per_task")]
    pub per_task: f64,

    #[serde(default = "default_per_agent_per_run")]
    pub per_agent_per_run: f64,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// BLOCK or ESCALATE.
    #[serde(default = "default_block")]
    pub on_exceed: Verdict,

    #[serde(default)]
    pub gaming: GamingConfig,
}

fn default_per_task() -> f64 {
    5.00
}
fn default_per_agent_per_run() -> f64 {
    1.00
}
fn default_currency() -> String {
    "USD".into()
}
fn default_block() -> Verdict {
    Verdict::Block
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_task: default_per_task(),
            per_agent_per_run: default_per_agent_per_run(),
            currency: default_currency(),
            on_exceed: default_block(),
            gaming: GamingConfig::default(),
        }
    }
}

/// Thresholds for flagging many-cheap-agents budget circumvention.
///
/// All conditions must hold at once for a task to be flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum distinct agents that have spent on the task.
    #[serde(default = "default_min_agents")]
    pub min_agents: usize,

    /// Mean per-agent spend must stay at or below this fraction of `per_agent_per_run`.
    #[serde(default = "default_mean_spend_ratio")]
    pub mean_spend_ratio: f64,

    /// Projected task total must reach this fraction of `per_task`.
    #[serde(default = "default_approach_ratio")]
    pub approach_ratio: f64,

    /// WARN or ESCALATE.
    #[serde(default = "default_escalate")]
    pub verdict: Verdict,
}

fn default_min_agents() -> usize {
    3
}
fn default_mean_spend_ratio() -> f64 {
    0.5
}
fn default_approach_ratio() -> f64 {
    0.8
}
fn default_escalate() -> Verdict {
    Verdict::Escalate
}

impl Default for GamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_agents: default_min_agents(),
            mean_spend_ratio: default_mean_spend_ratio(),
            approach_ratio: default_approach_ratio(),
            verdict: default_escalate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit applied to tools without their own entry, e.g. `"60/min"`.
    #[serde(default = "default_rate")]
    pub default: String,

    /// Tool name → limit string.
    #[serde(default)]
    pub per_tool: BTreeMap<String, String>,

    /// BLOCK or WARN.
    #[serde(default = "default_block")]
    pub on_exceed: Verdict,
}

fn default_rate() -> String {
    "60/min".into()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: default_rate(),
            per_tool: BTreeMap::new(),
            on_exceed: default_block(),
        }
    }
}

impl RateLimitConfig {
    /// Parsed default limit.
    pub fn default_spec(&self) -> Result<RateLimitSpec, ConfigError> {
        self.default.parse()
    }

    /// Parsed per-tool limits.
    pub fn tool_specs(&self) -> Result<BTreeMap<String, RateLimitSpec>, ConfigError> {
        self.per_tool
            .iter()
            .map(|(tool, spec)| Ok((tool.clone(), spec.parse()?)))
            .collect()
    }
}

/// A parsed `N/period` limit: at most `limit` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub limit: usize,
    pub window: Duration,
}

impl RateLimitSpec {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl FromStr for RateLimitSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            ConfigError::ValidationError(format!("invalid rate limit '{s}': {reason}"))
        };
        let (count, period) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected N/period"))?;
        let limit: usize = count
            .trim()
            .parse()
            .map_err(|_| invalid("count is not a non-negative integer"))?;
        let secs = match period.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" => 1,
            "m" | "min" | "minute" => 60,
            "h" | "hr" | "hour" => 3_600,
            "d" | "day" => 86_400,
            _ => return Err(invalid("unknown period")),
        };
        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub weights: RiskWeights,

    /// Action type → base severity overrides, e.g. `"billing.refund" = 0.7`.
    #[serde(default)]
    pub base_risks: BTreeMap<String, f64>,
}

/// Signal weights for the risk scorer. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    #[serde(default = "default_w_severity")]
    pub severity: f64,
    #[serde(default = "default_w_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_w_rest")]
    pub history: f64,
    #[serde(default = "default_w_rest")]
    pub cost: f64,
    #[serde(default = "default_w_rest")]
    pub trust: f64,
}

fn default_w_severity() -> f64 {
    0.30
}
fn default_w_sensitivity() -> f64 {
    0.25
}
fn default_w_rest() -> f64 {
    0.15
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            severity: default_w_severity(),
            sensitivity: default_w_sensitivity(),
            history: default_w_rest(),
            cost: default_w_rest(),
            trust: default_w_rest(),
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.severity + self.sensitivity + self.history + self.cost + self.trust
    }
}

/// Triggers for the approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_risk_levels")]
    pub risk_levels: Vec<RiskLevel>,

    /// Action-type globs that always require approval.
    #[serde(default)]
    pub action_types: Vec<String>,

    /// ESCALATE or DEFER.
    #[serde(default = "default_escalate")]
    pub verdict: Verdict,
}

fn default_approval_risk_levels() -> Vec<RiskLevel> {
    vec![RiskLevel::Critical]
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            risk_levels: default_approval_risk_levels(),
            action_types: vec![],
            verdict: default_escalate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Overrides the evaluator's built-in priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_mode: FailureMode::FailClosed,
            priority: None,
        }
    }
}

fn disabled_settings() -> EvaluatorSettings {
    EvaluatorSettings {
        enabled: false,
        ..EvaluatorSettings::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorToggles {
    #[serde(default)]
    pub schema_validator: EvaluatorSettings,
    #[serde(default)]
    pub policy: EvaluatorSettings,
    #[serde(default)]
    pub risk_scorer: EvaluatorSettings,
    #[serde(default)]
    pub rate_limiter: EvaluatorSettings,
    #[serde(default)]
    pub budget: EvaluatorSettings,
    /// Disabled unless explicitly turned on.
    #[serde(default = "disabled_settings")]
    pub approval_gate: EvaluatorSettings,
}

impl Default for EvaluatorToggles {
    fn default() -> Self {
        Self {
            schema_validator: EvaluatorSettings::default(),
            policy: EvaluatorSettings::default(),
            risk_scorer: EvaluatorSettings::default(),
            rate_limiter: EvaluatorSettings::default(),
            budget: EvaluatorSettings::default(),
            approval_gate: disabled_settings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Entries kept by the in-memory audit log.
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,

    /// Also emit each entry through `tracing`.
    #[serde(default = "default_true")]
    pub tracing: bool,
}

fn default_audit_capacity() -> usize {
    10_000
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
            tracing: true,
        }
    }
}

/// A policy declaration as written in configuration.
///
/// Fields left unset may be inherited through `extends`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Action-type globs, e.g. `["file.*", "shell.exec"]`.
    #[serde(default)]
    pub action_types: Vec<String>,

    /// Condition expression, e.g. `parameters.path.startswith("/etc")`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Who should review an ESCALATE from this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,

    /// Name of an earlier policy to inherit unset fields from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An agent registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(default = "default_trust_spec")]
    pub trust_level: TrustSpec,

    /// Agents this one may delegate to. Empty means unrestricted.
    #[serde(default)]
    pub can_delegate_to: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_actions_per_run: Option<u64>,
}

/// Trust written either as a named tier or as a raw score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrustSpec {
    Named(TrustLevel),
    Score(f64),
}

fn default_trust_spec() -> TrustSpec {
    TrustSpec::Named(TrustLevel::Peer)
}

impl TrustSpec {
    pub fn score(self) -> f64 {
        match self {
            TrustSpec::Named(level) => level.score(),
            TrustSpec::Score(score) => score,
        }
    }
}

/// Environment variables consulted by [`GuardConfig::load`].
pub const ENV_MAX_RISK_SCORE: &str = "ACTIONGUARD_MAX_RISK_SCORE";
pub const ENV_DEFAULT_VERDICT: &str = "ACTIONGUARD_DEFAULT_VERDICT";

impl GuardConfig {
    /// Load from `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in [`GuardConfig::load`]).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_MAX_RISK_SCORE) {
            self.global.max_risk_score = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{ENV_MAX_RISK_SCORE} is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_DEFAULT_VERDICT) {
            self.global.default_verdict = raw.parse().map_err(ConfigError::ValidationError)?;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.global;
        if !(g.max_risk_score > 0.0 && g.max_risk_score <= 1.0) {
            return Err(ConfigError::ValidationError(
                "global.max_risk_score must be in (0.0, 1.0]".into(),
            ));
        }
        if !matches!(g.on_risk_exceeded, Verdict::Block | Verdict::Escalate) {
            return Err(ConfigError::ValidationError(
                "global.on_risk_exceeded must be BLOCK or ESCALATE".into(),
            ));
        }

        let b = &self.budget;
        if !(b.per_task > 0.0 && b.per_agent_per_run > 0.0) {
            return Err(ConfigError::ValidationError(
                "budget.per_task and budget.per_agent_per_run must be > 0".into(),
            ));
        }
        if !matches!(b.on_exceed, Verdict::Block | Verdict::Escalate) {
            return Err(ConfigError::ValidationError(
                "budget.on_exceed must be BLOCK or ESCALATE".into(),
            ));
        }
        if !matches!(b.gaming.verdict, Verdict::Warn | Verdict::Escalate) {
            return Err(ConfigError::ValidationError(
                "budget.gaming.verdict must be WARN or ESCALATE".into(),
            ));
        }

        if !matches!(self.rate_limits.on_exceed, Verdict::Block | Verdict::Warn) {
            return Err(ConfigError::ValidationError(
                "rate_limits.on_exceed must be BLOCK or WARN".into(),
            ));
        }
        self.rate_limits.default_spec()?;
        self.rate_limits.tool_specs()?;

        let w = &self.risk.weights;
        let all = [w.severity, w.sensitivity, w.history, w.cost, w.trust];
        if all.iter().any(|x| !(0.0..=1.0).contains(x)) || (w.sum() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::ValidationError(format!(
                "risk weights must each be in [0, 1] and sum to 1.0 (got {:.4})",
                w.sum()
            )));
        }
        if let Some((name, _)) = self
            .risk
            .base_risks
            .iter()
            .find(|(_, r)| !(0.0..=1.0).contains(*r))
        {
            return Err(ConfigError::ValidationError(format!(
                "risk.base_risks.{name} must be in [0, 1]"
            )));
        }

        if !self.approval.verdict.is_pending() {
            return Err(ConfigError::ValidationError(
                "approval.verdict must be ESCALATE or DEFER".into(),
            ));
        }

        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::ValidationError("agent id cannot be empty".into()));
            }
            if !(0.0..=1.0).contains(&agent.trust_level.score()) {
                return Err(ConfigError::ValidationError(format!(
                    "trust_level for agent '{}' must be in [0, 1]",
                    agent.id
                )));
            }
        }

        for policy in &self.policies {
            if policy.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "policy name cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
