//! Event-type patterns
//!
//! A pattern is one of:
//! - an exact event type (`order.created`)
//! - the global wildcard `*`
//! - a glob where each `*` matches any run of characters (`order.*`)
//!
//! Globs must match the whole event type: `user.*` matches `user.created`
//! but not `admin.user.created`.

use crate::error::ValidationError;
use regex::Regex;

/// Reserved pattern that matches every event type.
pub const GLOBAL_PATTERN: &str = "*";

/// True for the reserved global key.
pub fn is_global(pattern: &str) -> bool {
    pattern == GLOBAL_PATTERN
}

/// True for patterns that need glob evaluation (contain `*` but are not `*`).
pub fn is_glob(pattern: &str) -> bool {
    !is_global(pattern) && pattern.contains('*')
}

/// Reject empty or whitespace-bearing patterns.
pub fn validate_pattern(pattern: &str) -> Result<(), ValidationError> {
    if pattern.is_empty() {
        return Err(ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern must not be empty".to_string(),
        });
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern must not contain whitespace".to_string(),
        });
    }
    Ok(())
}

/// Validate every pattern in a subscription list.
pub fn validate_patterns(patterns: &[String]) -> Result<(), ValidationError> {
    patterns.iter().try_for_each(|p| validate_pattern(p))
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    /// Compile a pattern, replacing each `*` with a greedy wildcard anchored
    /// at both ends.
    pub fn compile(pattern: &str) -> Result<Self, ValidationError> {
        validate_pattern(pattern)?;

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|e| {
            ValidationError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }
}

/// One-shot match without caching the compiled pattern.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if is_global(pattern) {
        return true;
    }
    if !is_glob(pattern) {
        return pattern == event_type;
    }
    GlobMatcher::compile(pattern)
        .map(|m| m.matches(event_type))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classification() {
        assert!(is_global("*"));
        assert!(!is_glob("*"));
        assert!(is_glob("order.*"));
        assert!(is_glob("*.created"));
        assert!(!is_glob("order.created"));
    }

    #[test]
    fn test_glob_full_string_match() {
        let m = GlobMatcher::compile("user.*").unwrap();
        assert!(m.matches("user.created"));
        assert!(m.matches("user.profile.updated"));
        assert!(!m.matches("admin.user.created"));
        assert!(!m.matches("user"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let m = GlobMatcher::compile("order.*").unwrap();
        // '.' is literal, not "any character"
        assert!(!m.matches("orderXcreated"));

        let m = GlobMatcher::compile("a+b.*").unwrap();
        assert!(m.matches("a+b.c"));
        assert!(!m.matches("aab.c"));
    }

    #[test]
    fn test_multiple_wildcards() {
        let m = GlobMatcher::compile("*.order.*").unwrap();
        assert!(m.matches("eu.order.created"));
        assert!(!m.matches("order.created"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("order created").is_err());
        assert!(validate_pattern("order.created").is_ok());
        assert!(validate_patterns(&["*".to_string(), "a.*".to_string()]).is_ok());
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*", "anything.at.all"));
        assert!(pattern_matches("promotion.started", "promotion.started"));
        assert!(!pattern_matches("promotion.started", "promotion.ended"));
        assert!(pattern_matches("promotion.*", "promotion.ended"));
    }

    proptest! {
        #[test]
        fn prop_namespace_glob_matches_children(ns in "[a-z]{1,8}", leaf in "[a-z_]{1,12}") {
            let m = GlobMatcher::compile(&format!("{ns}.*")).unwrap();
            let child = format!("{ns}.{leaf}");
            let nested = format!("x{ns}.{leaf}");
            prop_assert!(m.matches(&child));
            prop_assert!(!m.matches(&nested));
        }

        #[test]
        fn prop_exact_pattern_matches_only_itself(a in "[a-z.]{1,16}", b in "[a-z.]{1,16}") {
            prop_assert_eq!(pattern_matches(&a, &b), a == b);
        }
    }
}
