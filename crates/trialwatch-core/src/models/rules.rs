use crate::error::{CoreError, Result};
use crate::models::trial::{StudySelector, TrialScope, TrialState};
use regex::{Regex, RegexBuilder};
use std::time::Duration;

/// One (pattern, target-state) rule. Patterns are case-insensitive regexes.
#[derive(Debug, Clone)]
pub struct SignalRule {
    pub pattern: String,
    pub target: TrialState,
    regex: Regex,
}

impl SignalRule {
    pub fn new(pattern: &str, target: TrialState) -> Result<Self> {
        if !matches!(target, TrialState::Pruned | TrialState::Fail) {
            return Err(CoreError::InvalidRule(format!(
                "target state {} is not allowed, only PRUNED or FAIL",
                target
            )));
        }
        if pattern.trim().is_empty() {
            return Err(CoreError::InvalidRule("empty pattern".into()));
        }
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| CoreError::InvalidRule(format!("pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            pattern: pattern.to_string(),
            target,
            regex,
        })
    }

    pub fn is_match(&self, body: &str) -> bool {
        self.regex.is_match(body)
    }
}

/// Ordered rule list. Evaluation is first-match-wins in list order: when an
/// annotation matches several rules, the one configured earliest decides,
/// regardless of where each keyword appears in the text.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<SignalRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<SignalRule>) -> Self {
        Self { rules }
    }

    /// The default pair: prune pattern first, fail pattern second.
    pub fn prune_then_fail(prune_pattern: &str, fail_pattern: &str) -> Result<Self> {
        Ok(Self::new(vec![
            SignalRule::new(prune_pattern, TrialState::Pruned)?,
            SignalRule::new(fail_pattern, TrialState::Fail)?,
        ]))
    }

    pub fn first_match(&self, body: &str) -> Option<&SignalRule> {
        self.rules.iter().find(|rule| rule.is_match(body))
    }

    pub fn rules(&self) -> &[SignalRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn describe(&self) -> String {
        self.rules
            .iter()
            .map(|r| format!("'{}' -> {}", r.pattern, r.target))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub rules: RuleSet,
    pub scope: TrialScope,
    pub studies: StudySelector,
    pub dry_run: bool,
    /// Write a marker into the annotation (guarded by its version) before
    /// changing the state.
    pub mark_handled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            rules: RuleSet::default(),
            scope: TrialScope::ActiveOnly,
            studies: StudySelector::None,
            dry_run: false,
            mark_handled: false,
        }
    }
}
