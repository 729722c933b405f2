use std::fmt;

use regex::Regex;

/// A store-style name pattern where `*` matches any run of characters and
/// everything else is literal. Matches are anchored at both ends.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(pattern: impl Into<String>) -> Pattern {
        let raw = pattern.into();
        let source = format!("^{}$", regex::escape(&raw).replace(r"\*", ".*"));
        // Escaping leaves no metacharacter behind, so the source is always valid.
        let regex = Regex::new(&source).expect("escaped pattern compiles");
        Pattern { raw, regex }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        let pattern = Pattern::new("t_0");
        assert!(pattern.matches("t_0"));
        assert!(!pattern.matches("t_01"));
        assert!(!pattern.matches("xt_0"));
        assert!(!pattern.matches(""));
    }

    #[test]
    fn wildcard_matches_any_run() {
        let pattern = Pattern::new("t_*");
        assert!(pattern.matches("t_"));
        assert!(pattern.matches("t_0"));
        assert!(pattern.matches("t_anything/else"));
        assert!(!pattern.matches("s_0"));

        let pattern = Pattern::new("*");
        assert!(pattern.matches(""));
        assert!(pattern.matches("anything"));
    }

    #[test]
    fn inner_and_multiple_wildcards() {
        let pattern = Pattern::new("logs-*-2017");
        assert!(pattern.matches("logs-app-2017"));
        assert!(!pattern.matches("logs-app-2018"));

        let pattern = Pattern::new("*_test_*");
        assert!(pattern.matches("a_test_b"));
        assert!(!pattern.matches("a_test"));
    }

    #[test]
    fn metacharacters_are_literal() {
        let pattern = Pattern::new("a.b+c");
        assert!(pattern.matches("a.b+c"));
        assert!(!pattern.matches("aXb+c"));
    }
}
