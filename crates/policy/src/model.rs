//! Policy data model — compiled, ready-to-evaluate policies.

use crate::PolicyError;
use crate::condition::CompiledCondition;
use actionguard_config::PolicyConfig;
use actionguard_core::Verdict;
use glob::Pattern;
use std::collections::HashMap;

/// A single compiled policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub description: String,
    globs: Vec<String>,
    patterns: Vec<Pattern>,
    condition: CompiledCondition,
    pub verdict: Verdict,
    pub message: String,
    /// Who should review an ESCALATE from this policy.
    pub escalate_to: Option<String>,
    pub enabled: bool,
}

impl Policy {
    /// Compile a policy whose inheritance has already been resolved.
    pub fn compile(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(PolicyError::Invalid {
                name: "(empty)".into(),
                reason: "policy name cannot be empty".into(),
            });
        }
        let verdict = config.verdict.ok_or_else(|| PolicyError::Invalid {
            name: name.to_string(),
            reason: "no verdict set (directly or through 'extends')".into(),
        })?;

        let globs = if config.action_types.is_empty() {
            vec!["*".to_string()]
        } else {
            config.action_types.clone()
        };
        let patterns = globs
            .iter()
            .map(|g| {
                Pattern::new(g).map_err(|e| PolicyError::Glob {
                    name: name.to_string(),
                    pattern: g.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let condition = crate::compile(config.condition.as_deref().unwrap_or_default()).map_err(
            |source| PolicyError::Syntax {
                name: name.to_string(),
                source,
            },
        )?;

        Ok(Self {
            name: name.to_string(),
            description: config.description.clone().unwrap_or_default(),
            globs,
            patterns,
            condition,
            verdict,
            message: config
                .message
                .clone()
                .unwrap_or_else(|| format!("Policy '{name}' matched")),
            escalate_to: config.escalate_to.clone(),
            enabled: config.enabled,
        })
    }

    /// Does any of this policy's globs match `action_type`?
    pub fn matches_action(&self, action_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(action_type))
    }

    pub fn globs(&self) -> &[String] {
        &self.globs
    }

    pub fn condition(&self) -> &CompiledCondition {
        &self.condition
    }

    /// True when the policy fires on every action its globs match.
    pub fn is_unconditional(&self) -> bool {
        self.condition.is_always()
    }

    /// Do this policy's globs match every action type `other` could match?
    pub(crate) fn covers(&self, other: &Policy) -> bool {
        if self.globs.iter().any(|g| g == "*") {
            return true;
        }
        other
            .globs
            .iter()
            .all(|g| self.globs.contains(g) || self.matches_action(g))
    }
}

/// Resolve `extends` for every entry, keeping declaration order.
///
/// Unset fields (`None`, or empty `action_types`) are filled from the
/// parent chain. Unknown parents and cycles fail only the entries
/// involved.
pub(crate) fn resolve_inheritance(configs: &[PolicyConfig]) -> Vec<Result<PolicyConfig, PolicyError>> {
    let by_name: HashMap<&str, &PolicyConfig> = configs
        .iter()
        .rev()
        .map(|c| (c.name.as_str(), c))
        .collect();

    configs
        .iter()
        .map(|config| {
            let mut resolved = config.clone();
            let mut seen = vec![config.name.as_str()];
            let mut parent_name = config.extends.as_deref();

            while let Some(parent) = parent_name {
                if seen.contains(&parent) {
                    return Err(PolicyError::Invalid {
                        name: config.name.clone(),
                        reason: format!("'extends' cycle through '{parent}'"),
                    });
                }
                let Some(parent_cfg) = by_name.get(parent) else {
                    return Err(PolicyError::Invalid {
                        name: config.name.clone(),
                        reason: format!("extends unknown policy '{parent}'"),
                    });
                };
                inherit(&mut resolved, parent_cfg);
                seen.push(parent);
                parent_name = parent_cfg.extends.as_deref();
            }
            Ok(resolved)
        })
        .collect()
}

fn inherit(child: &mut PolicyConfig, parent: &PolicyConfig) {
    if child.action_types.is_empty() {
        child.action_types = parent.action_types.clone();
    }
    child.description = child.description.take().or_else(|| parent.description.clone());
    child.condition = child.condition.take().or_else(|| parent.condition.clone());
    child.verdict = child.verdict.or(parent.verdict);
    child.message = child.message.take().or_else(|| parent.message.clone());
    child.escalate_to = child.escalate_to.take().or_else(|| parent.escalate_to.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> PolicyConfig {
        PolicyConfig {
            name: name.into(),
            description: None,
            action_types: vec![],
            condition: None,
            verdict: None,
            message: None,
            escalate_to: None,
            extends: None,
            enabled: true,
        }
    }

    #[test]
    fn empty_globs_match_everything() {
        let mut c = cfg("catch-all");
        c.verdict = Some(Verdict::Warn);
        let policy = Policy::compile(&c).unwrap();
        assert_eq!(policy.globs(), ["*"]);
        assert!(policy.matches_action("anything.at.all"));
        assert!(policy.is_unconditional());
    }

    #[test]
    fn globs_match_dotted_types() {
        let mut c = cfg("http");
        c.action_types = vec!["http.*".into(), "shell.exec".into()];
        c.verdict = Some(Verdict::Block);
        let policy = Policy::compile(&c).unwrap();
        assert!(policy.matches_action("http.post"));
        assert!(policy.matches_action("shell.exec"));
        assert!(!policy.matches_action("file.read"));
        assert!(!policy.matches_action("https.get"));
    }

    #[test]
    fn missing_verdict_is_invalid() {
        let err = Policy::compile(&cfg("no-verdict")).unwrap_err();
        assert!(matches!(err, PolicyError::Invalid { .. }));
    }

    #[test]
    fn bad_glob_is_reported() {
        let mut c = cfg("bad-glob");
        c.action_types = vec!["file.[".into()];
        c.verdict = Some(Verdict::Block);
        assert!(matches!(
            Policy::compile(&c).unwrap_err(),
            PolicyError::Glob { .. }
        ));
    }

    #[test]
    fn default_message_names_the_policy() {
        let mut c = cfg("quiet");
        c.verdict = Some(Verdict::Warn);
        assert_eq!(Policy::compile(&c).unwrap().message, "Policy 'quiet' matched");
    }

    #[test]
    fn extends_fills_unset_fields() {
        let mut base = cfg("base");
        base.action_types = vec!["file.*".into()];
        base.condition = Some("parameters.path.startswith('/etc')".into());
        base.verdict = Some(Verdict::Block);
        base.message = Some("no system files".into());

        let mut child = cfg("child");
        child.extends = Some("base".into());
        child.verdict = Some(Verdict::Escalate);

        let resolved = resolve_inheritance(&[base, child]);
        let child = resolved[1].as_ref().unwrap();
        assert_eq!(child.action_types, vec!["file.*".to_string()]);
        assert_eq!(child.verdict, Some(Verdict::Escalate));
        assert_eq!(child.message.as_deref(), Some("no system files"));
        assert!(child.condition.is_some());
    }

    #[test]
    fn extends_follows_grandparents() {
        let mut a = cfg("a");
        a.verdict = Some(Verdict::Warn);
        a.escalate_to = Some("security".into());
        let mut b = cfg("b");
        b.extends = Some("a".into());
        let mut c = cfg("c");
        c.extends = Some("b".into());

        let resolved = resolve_inheritance(&[a, b, c]);
        let c = resolved[2].as_ref().unwrap();
        assert_eq!(c.verdict, Some(Verdict::Warn));
        assert_eq!(c.escalate_to.as_deref(), Some("security"));
    }

    #[test]
    fn extends_cycles_and_unknown_parents_fail() {
        let mut a = cfg("a");
        a.extends = Some("b".into());
        let mut b = cfg("b");
        b.extends = Some("a".into());
        let mut orphan = cfg("orphan");
        orphan.extends = Some("nobody".into());
        let mut fine = cfg("fine");
        fine.verdict = Some(Verdict::Allow);

        let resolved = resolve_inheritance(&[a, b, orphan, fine]);
        assert!(resolved[0].is_err());
        assert!(resolved[1].is_err());
        let err = resolved[2].as_ref().unwrap_err();
        assert!(err.to_string().contains("nobody"));
        assert!(resolved[3].is_ok());
    }

    #[test]
    fn coverage_by_globs() {
        let mut all = cfg("all");
        all.verdict = Some(Verdict::Block);
        let mut files = cfg("files");
        files.action_types = vec!["file.*".into()];
        files.verdict = Some(Verdict::Block);
        let mut delete = cfg("delete");
        delete.action_types = vec!["file.delete".into()];
        delete.verdict = Some(Verdict::Block);

        let all = Policy::compile(&all).unwrap();
        let files = Policy::compile(&files).unwrap();
        let delete = Policy::compile(&delete).unwrap();
        assert!(all.covers(&files));
        assert!(files.covers(&delete));
        assert!(!delete.covers(&files));
    }
}
