//! Sliding-window rate limiting per (agent, tool).
//!
//! Each key keeps the timestamps of its admitted calls. Pruning, counting
//! and recording happen under one lock, so no window ever admits more
//! than its limit even under concurrent checks.

use crate::Stage;
use actionguard_config::{ConfigError, EvaluatorSettings, RateLimitConfig, RateLimitSpec};
use actionguard_core::{
    ActionIntent, Evaluator, EvaluatorResult, FailureMode, RateLimitExceeded, Result, Verdict,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const NAME: &str = "rate_limiter";

/// Key count above which idle keys are swept.
const MAX_KEYS: usize = 10_000;

type Key = (String, String);

pub struct RateLimiter {
    default: RateLimitSpec,
    per_tool: BTreeMap<String, RateLimitSpec>,
    on_exceed: Verdict,
    windows: Mutex<HashMap<Key, VecDeque<Instant>>>,
    stage: Stage,
}

impl RateLimiter {
    pub fn new(
        default: RateLimitSpec,
        per_tool: BTreeMap<String, RateLimitSpec>,
        on_exceed: Verdict,
    ) -> Self {
        Self {
            default,
            per_tool,
            on_exceed,
            windows: Mutex::new(HashMap::new()),
            stage: Stage::new(40),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(
            config.default_spec()?,
            config.tool_specs()?,
            config.on_exceed,
        ))
    }

    pub fn with_settings(mut self, settings: &EvaluatorSettings) -> Self {
        self.stage = self.stage.configured(settings);
        self
    }

    /// The limit that applies to `tool`.
    pub fn limit_for(&self, tool: &str) -> RateLimitSpec {
        self.per_tool.get(tool).copied().unwrap_or(self.default)
    }

    /// Admit one call by `agent_id` to `tool`, or refuse it.
    pub fn check(&self, agent_id: &str, tool: &str) -> std::result::Result<(), RateLimitExceeded> {
        let spec = self.limit_for(tool);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let key = (agent_id.to_string(), tool.to_string());
        if windows.len() >= MAX_KEYS && !windows.contains_key(&key) {
            self.sweep(&mut windows, now);
        }

        let window = windows.entry(key).or_default();
        prune(window, now, spec);
        if window.len() >= spec.limit {
            return Err(exceeded(agent_id, tool, spec));
        }
        window.push_back(now);
        debug!(
            agent = %agent_id,
            tool = %tool,
            used = window.len(),
            limit = spec.limit,
            "Rate limit slot taken"
        );
        Ok(())
    }

    /// Whether [`check`](Self::check) would admit the call now. Takes no slot.
    pub fn peek(&self, agent_id: &str, tool: &str) -> std::result::Result<(), RateLimitExceeded> {
        let spec = self.limit_for(tool);
        if self.usage(agent_id, tool) >= spec.limit {
            return Err(exceeded(agent_id, tool, spec));
        }
        Ok(())
    }

    /// Calls currently counted against (agent, tool).
    pub fn usage(&self, agent_id: &str, tool: &str) -> usize {
        let spec = self.limit_for(tool);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .get_mut(&(agent_id.to_string(), tool.to_string()))
            .map_or(0, |window| {
                prune(window, now, spec);
                window.len()
            })
    }

    /// Forget every window.
    pub fn reset(&self) {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn sweep(&self, windows: &mut HashMap<Key, VecDeque<Instant>>, now: Instant) {
        let before = windows.len();
        windows.retain(|(_, tool), window| {
            prune(window, now, self.limit_for(tool));
            !window.is_empty()
        });
        debug!(evicted = before - windows.len(), "Idle rate-limit keys evicted");
    }
}

fn exceeded(agent_id: &str, tool: &str, spec: RateLimitSpec) -> RateLimitExceeded {
    RateLimitExceeded {
        agent_id: agent_id.to_string(),
        tool: tool.to_string(),
        limit: spec.limit,
        window_secs: spec.window.as_secs(),
    }
}

/// Drop timestamps strictly older than `now - window`.
fn prune(window: &mut VecDeque<Instant>, now: Instant, spec: RateLimitSpec) {
    while window
        .front()
        .is_some_and(|t| now.duration_since(*t) > spec.window)
    {
        window.pop_front();
    }
}

impl Evaluator for RateLimiter {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        self.stage.priority
    }

    fn failure_mode(&self) -> FailureMode {
        self.stage.failure_mode
    }

    fn evaluate(&self, intent: &ActionIntent) -> Result<EvaluatorResult> {
        Ok(self.result(intent, self.check(&intent.agent_id, &intent.tool_name)))
    }

    fn preview(&self, intent: &ActionIntent) -> Result<EvaluatorResult> {
        Ok(self.result(intent, self.peek(&intent.agent_id, &intent.tool_name)))
    }
}

impl RateLimiter {
    fn result(&self, intent: &ActionIntent, admitted: std::result::Result<(), RateLimitExceeded>) -> EvaluatorResult {
        match admitted {
            Ok(()) => EvaluatorResult::allow(NAME, "within rate limit"),
            Err(e) => {
                warn!(
                    agent = %intent.agent_id,
                    tool = %intent.tool_name,
                    limit = e.limit,
                    window_secs = e.window_secs,
                    verdict = %self.on_exceed,
                    "Rate limit exceeded"
                );
                EvaluatorResult::new(NAME, self.on_exceed, e.to_string())
                    .with_rule("rate_limit.exceeded")
                    .with_metadata("limit", e.limit.into())
                    .with_metadata("window_secs", e.window_secs.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionguard_config::GuardConfig;
    use std::time::Duration;

    fn limiter(limit: usize, secs: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimitSpec::new(limit, Duration::from_secs(secs)),
            BTreeMap::new(),
            Verdict::Block,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_call_in_window_is_blocked() {
        let rl = limiter(3, 60);
        let intent = ActionIntent::new("http.get", "web", "bot");
        for _ in 0..3 {
            assert_eq!(rl.evaluate(&intent).unwrap().verdict, Verdict::Allow);
        }
        let r = rl.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.rule.as_deref(), Some("rate_limit.exceeded"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(rl.evaluate(&intent).unwrap().verdict, Verdict::Block);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let rl = limiter(3, 60);
        for _ in 0..3 {
            rl.check("bot", "web").unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rl.usage("bot", "web"), 0);
        assert!(rl.check("bot", "web").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let rl = limiter(1, 60);
        rl.check("a", "web").unwrap();
        assert!(rl.check("a", "web").is_err());
        assert!(rl.check("b", "web").is_ok());
        assert!(rl.check("a", "db").is_ok());
        assert_eq!(rl.tracked_keys(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn per_tool_limits_override_the_default() {
        let cfg = GuardConfig::from_toml_str(
            r#"
            [rate_limits]
            default = "100/min"
            on_exceed = "WARN"

            [rate_limits.per_tool]
            email = "1/hour"
            "#,
        )
        .unwrap();
        let rl = RateLimiter::from_config(&cfg.rate_limits).unwrap();
        let intent = ActionIntent::new("email.send", "email", "bot");
        assert_eq!(rl.evaluate(&intent).unwrap().verdict, Verdict::Allow);
        let r = rl.evaluate(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Warn);
        assert_eq!(r.metadata["window_secs"], 3600);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(rl.evaluate(&intent).unwrap().verdict, Verdict::Allow);
    }

    #[test]
    fn concurrent_checks_never_exceed_the_limit() {
        let rl = std::sync::Arc::new(limiter(10, 60));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let rl = std::sync::Arc::clone(&rl);
                std::thread::spawn(move || rl.check("bot", "web").is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn previews_take_no_slot() {
        let rl = limiter(1, 60);
        let intent = ActionIntent::new("http.get", "web", "bot");
        for _ in 0..3 {
            assert_eq!(rl.preview(&intent).unwrap().verdict, Verdict::Allow);
        }
        assert_eq!(rl.usage("bot", "web"), 0);
        assert_eq!(rl.tracked_keys(), 0);

        assert_eq!(rl.evaluate(&intent).unwrap().verdict, Verdict::Allow);
        let r = rl.preview(&intent).unwrap();
        assert_eq!(r.verdict, Verdict::Block);
        assert_eq!(r.rule.as_deref(), Some("rate_limit.exceeded"));
        assert_eq!(rl.usage("bot", "web"), 1);
    }

    #[test]
    fn zero_limit_refuses_everything() {
        let rl = limiter(0, 1);
        let err = rl.check("bot", "web").unwrap_err();
        assert_eq!(err.limit, 0);
        assert_eq!(err.window_secs, 1);
    }
}
