//! `actionguard validate` — load a config and report policy problems.

use super::load_config;
use actionguard_config::GuardConfig;
use actionguard_policy::{PolicyEngine, PolicyError, Shadowed};
use std::path::Path;
use std::process::ExitCode;

/// What a validation run found.
#[derive(Debug)]
pub struct ValidationReport {
    pub loaded: usize,
    pub active: usize,
    pub rejected: Vec<PolicyError>,
    pub shadowed: Vec<Shadowed>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.shadowed.is_empty()
    }
}

pub fn check(config: &GuardConfig) -> ValidationReport {
    let report = PolicyEngine::load(&config.policies);
    ValidationReport {
        loaded: report.engine.len(),
        active: report.engine.active_count(),
        shadowed: report.engine.shadowed(),
        rejected: report.rejected,
    }
}

pub fn run(config_path: &Path) -> anyhow::Result<ExitCode> {
    println!("Validating {}...", config_path.display());
    let config = load_config(config_path)?;
    println!("   Config parsed and validated");
    println!("   Agents:    {}", config.agents.len());
    println!("   Policies:  {}", config.policies.len());

    let report = check(&config);
    println!(
        "   Compiled:  {} ({} enabled)",
        report.loaded, report.active
    );

    for e in &report.rejected {
        println!("   REJECTED  {e}");
    }
    for s in &report.shadowed {
        println!(
            "   SHADOWED  '{}' can never fire: '{}' always matches first",
            s.policy, s.by
        );
    }

    if report.rejected.is_empty() {
        if report.shadowed.is_empty() {
            println!("   All checks passed");
        }
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_rejected_and_shadowed_policies() {
        let config = GuardConfig::from_toml_str(
            r#"
            [[policies]]
            name = "block-all-files"
            action_types = ["file.*"]
            verdict = "BLOCK"

            [[policies]]
            name = "warn-file-write"
            action_types = ["file.write"]
            verdict = "WARN"

            [[policies]]
            name = "broken"
            action_types = ["shell.*"]
            condition = 'parameters.cmd =='
            verdict = "BLOCK"
            "#,
        )
        .unwrap();

        let report = check(&config);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].policy_name(), "broken");
        assert_eq!(report.shadowed.len(), 1);
        assert_eq!(report.shadowed[0].policy, "warn-file-write");
        assert!(!report.is_clean());
    }

    #[test]
    fn empty_policy_set_is_clean() {
        let report = check(&GuardConfig::default());
        assert!(report.is_clean());
        assert_eq!(report.loaded, 0);
    }
}
