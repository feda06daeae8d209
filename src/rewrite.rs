//! Rewrite rules applied by a listener before static file lookup
//!
//! A rule is written as `"<from> -> <to>"`. The `from` side is matched against
//! the whole request path: parenthesized groups are regular expressions,
//! `:name` captures one path segment, everything else is literal. The `to`
//! side may reference captures with `$1`..`$9`. Rules are tried in order and
//! the first match wins.

use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Separator between the two halves of a rule string
const ARROW: &str = "->";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("rewrite rule must look like '<from> -> <to>': {0}")]
    Syntax(String),

    #[error("invalid rewrite pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("alias path must be a non-empty path: '{0}'")]
    AliasPath(String),
}

/// Where a matched request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewritten {
    /// Absolute http(s) URL, forwarded to another server
    Proxy(String),
    /// Local path, served from this listener's directory
    Local(String),
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    from: String,
    to: String,
    regex: Regex,
}

impl RewriteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self, RewriteError> {
        let from = from.into();
        let to = to.into();
        let regex = compile_pattern(&from)?;
        Ok(Self { from, to, regex })
    }

    /// Parse a rule string such as `"/mt/(.*) -> http://127.0.0.1:8001/$1"`
    pub fn parse(rule: &str) -> Result<Self, RewriteError> {
        let (from, to) = rule
            .split_once(ARROW)
            .ok_or_else(|| RewriteError::Syntax(rule.to_string()))?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return Err(RewriteError::Syntax(rule.to_string()));
        }
        Self::new(from, to)
    }

    /// Build the rule that maps `/{prefix}/...` onto `{target_url}/...`
    pub fn alias(prefix: &str, target_url: &str) -> Result<Self, RewriteError> {
        let encoded = encode_alias_path(prefix)?;
        let target = target_url.trim_end_matches('/');
        Self::new(format!("/{}/(.*)", encoded), format!("{}/$1", target))
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    /// Apply the rule to a request path, returning the rewritten target
    pub fn apply(&self, path: &str) -> Option<String> {
        let captures = self.regex.captures(path)?;
        let mut out = String::with_capacity(self.to.len() + path.len());
        let mut chars = self.to.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' {
                if let Some(digit) = chars.peek().and_then(|d| d.to_digit(10)) {
                    chars.next();
                    if let Some(m) = captures.get(digit as usize) {
                        out.push_str(m.as_str());
                    }
                    continue;
                }
            }
            out.push(c);
        }

        Some(out)
    }
}

impl fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.from, ARROW, self.to)
    }
}

impl PartialEq for RewriteRule {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from && self.to == other.to
    }
}

/// Ordered rule list; the first matching rule wins
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewriteRules {
    rules: Vec<RewriteRule>,
}

impl RewriteRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: RewriteRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RewriteRule> {
        self.rules.iter()
    }

    /// Whether any rule forwards to an `https://` upstream
    pub fn has_https_target(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.to.get(..8).is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://")))
    }

    /// Resolve a request path (without query) against the rules
    pub fn resolve(&self, path: &str) -> Option<Rewritten> {
        self.rules.iter().find_map(|rule| rule.apply(path)).map(|target| {
            if is_absolute_url(&target) {
                Rewritten::Proxy(target)
            } else {
                Rewritten::Local(target)
            }
        })
    }
}

impl FromIterator<RewriteRule> for RewriteRules {
    fn from_iter<I: IntoIterator<Item = RewriteRule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

pub fn is_absolute_url(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Percent-encode an alias path, keeping `/` as the segment separator.
///
/// Leading and trailing slashes and surrounding whitespace are dropped. Empty
/// segments and `.`/`..` segments are rejected.
pub fn encode_alias_path(prefix: &str) -> Result<String, RewriteError> {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(RewriteError::AliasPath(prefix.to_string()));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(RewriteError::AliasPath(prefix.to_string()));
        }
        segments.push(urlencoding::encode(segment).into_owned());
    }

    Ok(segments.join("/"))
}

fn compile_pattern(pattern: &str) -> Result<Regex, RewriteError> {
    let mut source = String::from("^");
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();

    let flush = |literal: &mut String, source: &mut String| {
        source.push_str(&regex::escape(literal));
        literal.clear();
    };

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                flush(&mut literal, &mut source);
                let mut depth = 1;
                let mut group = String::from("(");
                for g in chars.by_ref() {
                    group.push(g);
                    match g {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                if depth != 0 {
                    return Err(RewriteError::Pattern {
                        pattern: pattern.to_string(),
                        message: "unbalanced parenthesis".to_string(),
                    });
                }
                source.push_str(&group);
            }
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                flush(&mut literal, &mut source);
                while chars
                    .peek()
                    .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_')
                {
                    chars.next();
                }
                source.push_str("([^/]+)");
            }
            _ => literal.push(c),
        }
    }
    flush(&mut literal, &mut source);
    source.push('$');

    Regex::new(&source).map_err(|e| RewriteError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}
