//! Subcommand implementations and the helpers they share.

pub mod check;
pub mod explain;
pub mod validate;

use actionguard_config::GuardConfig;
use actionguard_core::{ActionIntent, Verdict};
use anyhow::Context;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

/// Exit status for a verdict: 0 runs, 2 waits for review, 3 refused.
pub fn exit_status(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Allow | Verdict::Warn => 0,
        Verdict::Escalate | Verdict::Defer => 2,
        Verdict::Block => 3,
    }
}

pub fn exit_code(verdict: Verdict) -> ExitCode {
    ExitCode::from(exit_status(verdict))
}

/// Load, override from the environment and validate a config file.
pub fn load_config(path: &Path) -> anyhow::Result<GuardConfig> {
    GuardConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

/// Read intents from `path` (`-` is stdin). Accepts one object or an array.
pub fn read_intents(path: &Path) -> anyhow::Result<Vec<ActionIntent>> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading intent from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading intent file {}", path.display()))?
    };
    parse_intents(&raw).with_context(|| format!("parsing intent {}", path.display()))
}

pub fn parse_intents(raw: &str) -> anyhow::Result<Vec<ActionIntent>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let intents = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<ActionIntent>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    anyhow::ensure!(!intents.is_empty(), "no intents given");
    Ok(intents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_map_to_exit_codes() {
        assert_eq!(exit_status(Verdict::Allow), 0);
        assert_eq!(exit_status(Verdict::Warn), 0);
        assert_eq!(exit_status(Verdict::Defer), 2);
        assert_eq!(exit_status(Verdict::Escalate), 2);
        assert_eq!(exit_status(Verdict::Block), 3);
    }

    #[test]
    fn single_objects_and_arrays_parse() {
        let one = parse_intents(r#"{"action_type": "file.read", "tool_name": "fs", "agent_id": "a"}"#)
            .unwrap();
        assert_eq!(one.len(), 1);
        assert!(!one[0].action_id.is_empty());

        let many = parse_intents(
            r#"[{"action_type": "file.read", "tool_name": "fs", "agent_id": "a"},
                {"action_type": "http.get", "tool_name": "web", "agent_id": "b", "task_id": "t"}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].task_id.as_deref(), Some("t"));

        assert!(parse_intents("[]").is_err());
        assert!(parse_intents(r#"{"tool_name": "fs"}"#).is_err());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.global.max_delegation_depth, 4);
    }
}
