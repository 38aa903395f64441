//! `actionguard check` — evaluate intents and print the decisions.

use super::{exit_code, load_config, read_intents};
use actionguard_core::{ActionIntent, Verdict};
use actionguard_pipeline::{Decision, Guard};
use anyhow::Context;
use futures::future::join_all;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;

pub async fn run(config_path: &Path, intent_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let intents = read_intents(intent_path)?;
    let guard = Arc::new(Guard::from_config(&config).context("building guard")?);
    debug!(intents = intents.len(), config = %config_path.display(), "Evaluating");

    let decisions = evaluate_all(&guard, intents).await;
    let output = match decisions.as_slice() {
        [single] => serde_json::to_string_pretty(single)?,
        many => serde_json::to_string_pretty(many)?,
    };
    println!("{output}");

    Ok(exit_code(worst(&decisions)))
}

/// Evaluate every intent concurrently; decisions come back in input order.
pub async fn evaluate_all(guard: &Arc<Guard>, intents: Vec<ActionIntent>) -> Vec<Decision> {
    join_all(intents.into_iter().map(|intent| guard.evaluate_async(intent))).await
}

/// The most restrictive verdict across `decisions`.
pub fn worst(decisions: &[Decision]) -> Verdict {
    decisions
        .iter()
        .map(|d| d.verdict)
        .max()
        .unwrap_or(Verdict::Allow)
}
