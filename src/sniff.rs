//! Credential pattern matching
//!
//! The scanner only sees the [`Sniffer`] trait: give it a line with its
//! path and line number, get back the spans that look like credentials.
//! The rules version identifies the detection logic and must be bumped
//! whenever a rule is added or changed.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

/// Version of the built-in rule set
pub const RULES_VERSION: u32 = 1;

/// Lines longer than this (minified bundles, embedded data) are skipped
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub line_number: u32,
    /// Byte offsets of the match within the line
    pub match_start: u32,
    pub match_end: u32,
    pub rule: String,
}

pub trait Sniffer: Send + Sync {
    fn sniff(&self, path: &str, line_number: u32, content: &[u8]) -> Vec<Violation>;

    fn rules_version(&self) -> u32;
}

/// A named pattern. When the pattern has a capture group, the first group
/// is the reported span.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pattern: Regex,
}

impl Rule {
    pub fn new(name: &str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
        })
    }
}

const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (
        "aws-access-key-id",
        r"\b((?:AKIA|ASIA|AGPA|AIDA|AROA|AIPA|ANPA|ANVA)[A-Z0-9]{16})\b",
    ),
    (
        "private-key",
        r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP |ENCRYPTED )?PRIVATE KEY(?: BLOCK)?-----",
    ),
    ("github-token", r"\b(gh[pousr]_[A-Za-z0-9]{36,255})\b"),
    ("slack-token", r"\b(xox[abposr]-[0-9A-Za-z-]{10,72})"),
    (
        "password-assignment",
        r#"(?i)(?:password|passwd|secret|api_?key|access_?token)["']?\s*[:=]\s*["']([^"'\s]{8,})["']"#,
    ),
];

static BUILTIN_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    BUILTIN_PATTERNS
        .iter()
        .filter_map(|(name, pattern)| match Rule::new(name, pattern) {
            Ok(rule) => Some(rule),
            Err(e) => {
                log::error!("Skipping credential rule '{}': {}", name, e);
                None
            }
        })
        .collect()
});

/// Regex rule set
#[derive(Debug, Clone)]
pub struct PatternSniffer {
    rules: Vec<Rule>,
    version: u32,
}

impl PatternSniffer {
    /// Built-in rules at [`RULES_VERSION`]
    pub fn new() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
            version: RULES_VERSION,
        }
    }

    pub fn with_rules(rules: Vec<Rule>, version: u32) -> Self {
        Self { rules, version }
    }

    /// Copy of the built-in rules, for extending under a new version
    pub fn builtin_rules() -> Vec<Rule> {
        BUILTIN_RULES.clone()
    }
}

impl Default for PatternSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sniffer for PatternSniffer {
    fn sniff(&self, path: &str, line_number: u32, content: &[u8]) -> Vec<Violation> {
        if content.len() > MAX_LINE_LEN {
            return Vec::new();
        }
        let mut violations = Vec::new();
        for rule in &self.rules {
            for captures in rule.pattern.captures_iter(content) {
                let Some(span) = captures.get(1).or_else(|| captures.get(0)) else {
                    continue;
                };
                violations.push(Violation {
                    path: path.to_string(),
                    line_number,
                    match_start: span.start() as u32,
                    match_end: span.end() as u32,
                    rule: rule.name.clone(),
                });
            }
        }
        violations
    }

    fn rules_version(&self) -> u32 {
        self.version
    }
}
