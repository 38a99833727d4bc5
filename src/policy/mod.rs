//! Admission policy for untrusted job source.
//!
//! The engine is the single trust boundary of the gate: a job runs only if
//! none of the rules in its table match. Every rule is evaluated so a
//! rejection always carries the complete set of reasons.
//!
//! Matching is textual. The raw substring rules can false-positive on
//! comments and string literals; the token rules in [`rules::default_rules`]
//! add coverage for disguised calls the substring rules miss. Neither is a
//! parser, and the runtime shim (see [`crate::worker::shim`]) is the second
//! line of defense.

pub mod lexer;
pub mod rules;

use serde::Serialize;

use crate::config::PolicyConfig;
pub use rules::{default_rules, Matcher, RejectReason, Rule};

/// One matched rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub reason: RejectReason,
    pub pattern: String,
    pub description: String,
    pub line: Option<usize>,
}

/// Outcome of evaluating one source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl PolicyDecision {
    /// Distinct reasons, in rule order.
    pub fn reasons(&self) -> Vec<RejectReason> {
        let mut reasons = Vec::new();
        for v in &self.violations {
            if !reasons.contains(&v.reason) {
                reasons.push(v.reason);
            }
        }
        reasons
    }

    pub fn has_reason(&self, reason: RejectReason) -> bool {
        self.violations.iter().any(|v| v.reason == reason)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<Rule>,
}

impl PolicyEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            rules: default_rules(&config.allowed_module),
        }
    }

    /// An engine with an explicit rule table (no defaults).
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Append a rule; it runs after the existing ones.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, source: &str) -> PolicyDecision {
        let tokens = lexer::tokenize(source);
        let violations: Vec<Violation> = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.matcher.find(source, &tokens).map(|m| Violation {
                    reason: rule.reason,
                    pattern: m.pattern,
                    description: rule.description.clone(),
                    line: m.line,
                })
            })
            .collect();

        PolicyDecision {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}
