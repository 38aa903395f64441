//! `actionguard explain` — show how every layer sees an intent.

use super::{load_config, read_intents};
use actionguard_pipeline::{Explanation, Guard};
use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;

pub fn run(config_path: &Path, intent_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let guard = Guard::from_config(&config).context("building guard")?;

    for intent in read_intents(intent_path)? {
        println!(
            "Intent {} ({} via {} by {}):",
            intent.action_id, intent.action_type, intent.tool_name, intent.agent_id
        );
        print!("{}", render(&guard.explain(&intent)));
    }
    Ok(ExitCode::SUCCESS)
}

/// Plain-text report of an [`Explanation`].
pub fn render(explanation: &Explanation) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n  Evaluators:");
    for (i, stage) in explanation.stages.iter().enumerate() {
        let status = if stage.enabled { "ON " } else { "OFF" };
        let _ = writeln!(
            out,
            "    {}. [{}] {} (priority: {}, on failure: {:?})",
            i + 1,
            status,
            stage.name,
            stage.priority,
            stage.failure_mode
        );
    }

    if let Some(reason) = &explanation.precheck {
        let _ = writeln!(out, "\n  Refused before evaluation: {reason}");
    }

    if let Some(outcome) = &explanation.outcome {
        let _ = writeln!(out, "\n  Results:");
        for r in &outcome.results {
            let _ = write!(out, "    {:<16} {:<8} {}", r.evaluator_name, r.verdict, r.reason);
            if let Some(rule) = &r.rule {
                let _ = write!(out, " [{rule}]");
            }
            if let Some(score) = r.risk_score {
                let _ = write!(out, " (risk {score:.3})");
            }
            let _ = writeln!(out);
        }
        let stopped = if outcome.stopped_early { ", stopped early" } else { "" };
        let _ = writeln!(out, "    => {}{stopped}", outcome.verdict);
    }

    if !explanation.policies.is_empty() {
        let _ = writeln!(out, "\n  Policies:");
        for p in &explanation.policies {
            let condition = match p.condition {
                Some(true) => "true",
                Some(false) => "false",
                None => "-",
            };
            let marker = if p.selected { "*" } else { " " };
            let _ = write!(
                out,
                "   {marker} {} (enabled: {}, glob: {}, condition: {condition}, verdict: {})",
                p.policy, p.enabled, p.glob_matched, p.verdict
            );
            if let Some(err) = &p.error {
                let _ = write!(out, " error: {err}");
            }
            let _ = writeln!(out);
        }
    }
    out
}
