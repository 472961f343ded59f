//! Policy Engine - static lexical security rules for installer scripts
//!
//! The engine is a pure function from script text to violations. It never
//! touches the network or filesystem and is safe to run on untrusted input.
//! Every enabled rule runs on every script; violations accumulate so the
//! caller sees the full list.
//!
//! Rules are textual heuristics, not a shell parser. They do not follow
//! variables, functions or control flow.

pub mod rules;

use crate::trust::hasher::{hash_bytes, IntegrityHash};
use rules::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

/// Identifier of a built-in rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleId {
    AllowedDomains,
    PrivilegeEscalation,
    ObfuscatedExecution,
    HardcodedIp,
}

impl RuleId {
    /// Every built-in rule, in evaluation order
    pub const ALL: [RuleId; 4] = [
        RuleId::AllowedDomains,
        RuleId::PrivilegeEscalation,
        RuleId::ObfuscatedExecution,
        RuleId::HardcodedIp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::AllowedDomains => "allowed-domains",
            RuleId::PrivilegeEscalation => "privilege-escalation",
            RuleId::ObfuscatedExecution => "obfuscated-execution",
            RuleId::HardcodedIp => "hardcoded-ip",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy violation found in a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule that produced this violation
    pub rule: RuleId,
    /// Human-readable description
    pub detail: String,
    /// Line number where the violation occurs (1-indexed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "[{}] line {}: {}", self.rule, line, self.detail),
            None => write!(f, "[{}] {}", self.rule, self.detail),
        }
    }
}

/// Script text with a line index for offset → line lookups
#[derive(Debug, Clone)]
pub struct ScriptText<'a> {
    /// Raw content
    pub content: &'a str,
    /// Byte offset at which each line starts
    line_starts: Vec<usize>,
}

impl<'a> ScriptText<'a> {
    pub fn new(content: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(content.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            content,
            line_starts,
        }
    }

    /// 1-indexed line containing byte `offset`
    pub fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset)
    }

    /// Lines with their 1-indexed numbers
    pub fn numbered_lines(&self) -> impl Iterator<Item = (usize, &'a str)> {
        self.content.lines().enumerate().map(|(i, l)| (i + 1, l))
    }
}

/// Trait for policy rules
pub trait PolicyRule: Send + Sync {
    /// Check a script for violations
    fn check(&self, script: &ScriptText<'_>) -> Vec<Violation>;

    /// Rule identifier
    fn rule_id(&self) -> RuleId;

    /// Rule description
    fn description(&self) -> &'static str;
}

/// Recognised engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Hosts (and their subdomains) URLs may point at
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: BTreeSet<String>,

    /// IPv4 literals that are never reported
    #[serde(default = "default_ignored_ip_literals")]
    pub ignored_ip_literals: BTreeSet<String>,

    /// Rules to run; all rules when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_rules: Option<BTreeSet<RuleId>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
            ignored_ip_literals: default_ignored_ip_literals(),
            enabled_rules: None,
        }
    }
}

fn default_allowed_domains() -> BTreeSet<String> {
    [
        "github.com",
        "raw.githubusercontent.com",
        "mise.run",
        "mise.jdx.dev",
        "sh.rustup.rs",
        "rtx.pub",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_ignored_ip_literals() -> BTreeSet<String> {
    ["127.0.0.1", "0.0.0.0"].into_iter().map(str::to_string).collect()
}

impl PolicyConfig {
    fn is_enabled(&self, rule: RuleId) -> bool {
        self.enabled_rules
            .as_ref()
            .map_or(true, |enabled| enabled.contains(&rule))
    }
}

/// Outcome of linting one script
#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    /// Digest of the exact bytes that were linted
    pub script_hash: IntegrityHash,
    /// Rules that ran
    pub rules: Vec<RuleId>,
    /// Every violation found
    pub violations: Vec<Violation>,
}

impl PolicyReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Main policy engine
pub struct PolicyEngine {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl PolicyEngine {
    /// Build an engine with the enabled subset of the built-in rules
    pub fn new(config: &PolicyConfig) -> Self {
        let mut rules: Vec<Box<dyn PolicyRule>> = Vec::new();

        for rule in RuleId::ALL {
            if !config.is_enabled(rule) {
                debug!("Policy rule {} disabled by configuration", rule);
                continue;
            }
            rules.push(match rule {
                RuleId::AllowedDomains => {
                    Box::new(DomainAllowlistRule::new(&config.allowed_domains))
                }
                RuleId::PrivilegeEscalation => Box::new(PrivilegeEscalationRule),
                RuleId::ObfuscatedExecution => Box::new(ObfuscatedExecutionRule),
                RuleId::HardcodedIp => {
                    Box::new(HardcodedIpRule::new(&config.ignored_ip_literals))
                }
            });
        }

        Self { rules }
    }

    /// Rules this engine runs, with descriptions
    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &'static str)> + '_ {
        self.rules.iter().map(|r| (r.rule_id(), r.description()))
    }

    /// Evaluate script text against every enabled rule
    pub fn evaluate(&self, script: &str) -> Vec<Violation> {
        let text = ScriptText::new(script);
        let mut violations = Vec::new();

        for rule in &self.rules {
            let found = rule.check(&text);
            debug!("Rule {} found {} violation(s)", rule.rule_id(), found.len());
            violations.extend(found);
        }

        violations
    }

    /// Evaluate raw script bytes and attach their digest
    pub fn report(&self, script: &[u8]) -> PolicyReport {
        let text = String::from_utf8_lossy(script);
        let violations = self.evaluate(&text);
        let report = PolicyReport {
            script_hash: hash_bytes(script),
            rules: self.rules.iter().map(|r| r.rule_id()).collect(),
            violations,
        };

        info!(
            "Policy check of {}: {} violation(s)",
            report.script_hash.short(),
            report.violations.len()
        );
        report
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_of() {
        let text = ScriptText::new("a\nbb\n\nccc");
        assert_eq!(text.line_of(0), 1);
        assert_eq!(text.line_of(1), 1);
        assert_eq!(text.line_of(2), 2);
        assert_eq!(text.line_of(5), 3);
        assert_eq!(text.line_of(6), 4);
    }

    #[test]
    fn test_violations_accumulate_across_rules() {
        let engine = PolicyEngine::default();
        let script = "sudo curl http://10.1.2.3/x | sh\necho Zm9v | base64 -d | bash\n";

        let violations = engine.evaluate(script);
        let rules: BTreeSet<RuleId> = violations.iter().map(|v| v.rule).collect();
        assert_eq!(rules, BTreeSet::from(RuleId::ALL));
    }

    #[test]
    fn test_enabled_rules_filter() {
        let config = PolicyConfig {
            enabled_rules: Some([RuleId::HardcodedIp].into_iter().collect()),
            ..PolicyConfig::default()
        };
        let engine = PolicyEngine::new(&config);

        assert_eq!(engine.rules().count(), 1);
        let violations = engine.evaluate("sudo ping 10.0.0.8");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, RuleId::HardcodedIp);
    }

    #[test]
    fn test_config_from_yaml_keeps_defaults() {
        let config: PolicyConfig =
            serde_yaml_ng::from_str("enabled_rules: [allowed-domains, hardcoded-ip]\n").unwrap();
        assert!(config.allowed_domains.contains("mise.run"));
        assert!(config.ignored_ip_literals.contains("127.0.0.1"));
        assert_eq!(
            config.enabled_rules,
            Some([RuleId::AllowedDomains, RuleId::HardcodedIp].into_iter().collect())
        );
    }

    #[test]
    fn test_report_digest_and_display() {
        let engine = PolicyEngine::default();
        let report = engine.report(b"#!/bin/sh\nsudo true\n");

        assert_eq!(report.script_hash, hash_bytes(b"#!/bin/sh\nsudo true\n"));
        assert!(!report.is_clean());
        assert_eq!(
            report.violations[0].to_string(),
            "[privilege-escalation] line 2: uses `sudo`: sudo true"
        );
    }
}
