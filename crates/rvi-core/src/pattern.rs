//! Name patterns: the authorization matcher.
//!
//! A pattern is a dot-separated glob over service names:
//!   - literal segments match themselves
//!   - `*` inside a segment matches any run of non-`.` characters
//!   - a segment that is exactly `**` matches one or more whole segments
//!
//! Patterns compile to anchored regular expressions, so `a.b` never
//! authorizes `a.b.c` or `a.bx`.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::error::RviError;

const SEGMENT: &str = "[^.]";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("pattern {0:?} contains an empty segment")]
    EmptySegment(String),
    #[error("pattern {0:?} contains whitespace")]
    Whitespace(String),
    #[error("pattern {0:?} failed to compile: {1}")]
    Compile(String, String),
}

impl From<PatternError> for RviError {
    fn from(e: PatternError) -> Self {
        RviError::ProtocolViolation(e.to_string())
    }
}

/// One compiled name pattern.
#[derive(Clone)]
pub struct NamePattern {
    source: String,
    regex: Regex,
}

impl NamePattern {
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        if source.is_empty() {
            return Err(PatternError::Empty);
        }
        if source.chars().any(char::is_whitespace) {
            return Err(PatternError::Whitespace(source.to_string()));
        }

        let mut expr = String::from("^");
        for (i, segment) in source.split('.').enumerate() {
            if segment.is_empty() {
                return Err(PatternError::EmptySegment(source.to_string()));
            }
            if i > 0 {
                expr.push_str(r"\.");
            }
            if segment == "**" {
                expr.push_str(&format!(r"{SEGMENT}+(?:\.{SEGMENT}+)*"));
                continue;
            }
            let pieces: Vec<String> = segment.split('*').map(regex::escape).collect();
            expr.push_str(&pieces.join(&format!("{SEGMENT}*")));
        }
        expr.push('$');

        let regex =
            Regex::new(&expr).map_err(|e| PatternError::Compile(source.to_string(), e.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// True iff the pattern matches the whole name.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamePattern").field(&self.source).finish()
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for NamePattern {}

/// Ordered set of patterns, deduplicated by source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: BTreeMap<String, NamePattern>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every source string; fails on the first malformed pattern.
    pub fn parse<I, S>(sources: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for source in sources {
            set.insert(NamePattern::parse(source.as_ref())?);
        }
        Ok(set)
    }

    /// Returns true if the pattern was not already present.
    pub fn insert(&mut self, pattern: NamePattern) -> bool {
        if self.patterns.contains_key(pattern.as_str()) {
            return false;
        }
        self.patterns.insert(pattern.source.clone(), pattern);
        true
    }

    /// Union `other` into `self`. Returns how many patterns were new.
    pub fn merge(&mut self, other: &PatternSet) -> usize {
        other
            .patterns
            .values()
            .filter(|p| self.insert((*p).clone()))
            .count()
    }

    pub fn matches(&self, name: &str) -> bool {
        matches(self, name)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamePattern> {
        self.patterns.values()
    }
}

/// True iff any pattern in the set matches the full service name.
pub fn matches(patterns: &PatternSet, name: &str) -> bool {
    patterns.patterns.values().any(|p| p.matches(name))
}

/// Check that `name` is a usable fully-qualified service name.
pub fn validate_service_name(name: &str) -> Result<(), RviError> {
    if name.is_empty() {
        return Err(RviError::InvalidArgument("empty service name".into()));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control() || c == '*') {
        return Err(RviError::InvalidArgument(format!(
            "service name {name:?} contains illegal characters"
        )));
    }
    if name.split('.').any(str::is_empty) {
        return Err(RviError::InvalidArgument(format!(
            "service name {name:?} contains an empty segment"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(sources: &[&str]) -> PatternSet {
        PatternSet::parse(sources).unwrap()
    }

    #[test]
    fn literal_pattern_is_anchored() {
        let p = set(&["a.b"]);
        assert!(p.matches("a.b"));
        assert!(!p.matches("a.b.c"));
        assert!(!p.matches("a.bx"));
        assert!(!p.matches("x.a.b"));
    }

    #[test]
    fn single_star_spans_one_segment() {
        let p = set(&["fleet.*"]);
        assert!(p.matches("fleet.status"));
        assert!(!p.matches("fleet.status.engine"));
        assert!(!p.matches("fleet"));
        assert!(!p.matches("fleetx.status"));
    }

    #[test]
    fn star_inside_segment() {
        let p = set(&["diag.p*g"]);
        assert!(p.matches("diag.ping"));
        assert!(p.matches("diag.pg"));
        assert!(!p.matches("diag.ping.x"));
    }

    #[test]
    fn double_star_spans_many_segments() {
        let p = set(&["fleet.**"]);
        assert!(p.matches("fleet.status"));
        assert!(p.matches("fleet.status.engine.temp"));
        assert!(!p.matches("fleet"));
        assert!(!p.matches("fleet."));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = set(&["a+b.c"]);
        assert!(p.matches("a+b.c"));
        assert!(!p.matches("aab.c"));
    }

    #[test]
    fn empty_set_matches_nothing() {
        assert!(!PatternSet::new().matches("anything"));
    }

    #[test]
    fn malformed_patterns_rejected() {
        assert_eq!(NamePattern::parse("").unwrap_err(), PatternError::Empty);
        assert!(matches!(
            NamePattern::parse("a..b"),
            Err(PatternError::EmptySegment(_))
        ));
        assert!(matches!(
            NamePattern::parse("a b"),
            Err(PatternError::Whitespace(_))
        ));
    }

    #[test]
    fn merge_is_a_union() {
        let mut a = set(&["fleet.*"]);
        let b = set(&["fleet.*", "diag.*"]);
        assert_eq!(a.merge(&b), 1);
        assert_eq!(a.len(), 2);
        assert_eq!(a.merge(&b), 0);
    }

    #[test]
    fn service_name_validation() {
        assert!(validate_service_name("fleet.status").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("fleet..status").is_err());
        assert!(validate_service_name("fleet.*").is_err());
        assert!(validate_service_name("fleet status").is_err());
    }
}
