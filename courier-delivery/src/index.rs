//! Subscription index
//!
//! Maps each subscribed pattern to the webhooks that registered it. Glob
//! patterns keep a compiled matcher alongside their id set so resolution
//! never recompiles.

use std::collections::{HashMap, HashSet};

use courier_core::{is_glob, is_global, GlobMatcher, ValidationError, WebhookId};

#[derive(Debug)]
struct PatternEntry {
    /// Present only for glob patterns.
    matcher: Option<GlobMatcher>,
    webhooks: HashSet<WebhookId>,
}

/// Pattern → webhook id sets, tenant-agnostic.
///
/// Tenant and `active` filtering happen on the resolved ids, against the
/// stored webhook records.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    patterns: HashMap<String, PatternEntry>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `webhook_id` under every pattern. Idempotent.
    pub fn subscribe(
        &mut self,
        webhook_id: WebhookId,
        patterns: &[String],
    ) -> Result<(), ValidationError> {
        // Compile everything first so a bad pattern leaves the index untouched.
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            courier_core::pattern::validate_pattern(pattern)?;
            let matcher = if is_glob(pattern) && !self.patterns.contains_key(pattern) {
                Some(GlobMatcher::compile(pattern)?)
            } else {
                None
            };
            compiled.push((pattern, matcher));
        }

        for (pattern, matcher) in compiled {
            self.patterns
                .entry(pattern.clone())
                .or_insert_with(|| PatternEntry {
                    matcher,
                    webhooks: HashSet::new(),
                })
                .webhooks
                .insert(webhook_id);
        }
        Ok(())
    }

    /// Remove `webhook_id` from every pattern, dropping patterns left empty.
    pub fn unsubscribe(&mut self, webhook_id: WebhookId, patterns: &[String]) {
        for pattern in patterns {
            let now_empty = match self.patterns.get_mut(pattern) {
                Some(entry) => {
                    entry.webhooks.remove(&webhook_id);
                    entry.webhooks.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.patterns.remove(pattern);
            }
        }
    }

    /// Webhook ids whose patterns match `event_type`: exact key, the global
    /// key, then every glob.
    pub fn candidates(&self, event_type: &str) -> HashSet<WebhookId> {
        let mut ids = HashSet::new();

        if let Some(entry) = self.patterns.get(event_type) {
            ids.extend(entry.webhooks.iter().copied());
        }
        if let Some(entry) = self.patterns.get(courier_core::GLOBAL_PATTERN) {
            ids.extend(entry.webhooks.iter().copied());
        }
        for (pattern, entry) in &self.patterns {
            if is_global(pattern) || pattern == event_type {
                continue;
            }
            if let Some(matcher) = &entry.matcher {
                if matcher.matches(event_type) {
                    ids.extend(entry.webhooks.iter().copied());
                }
            }
        }

        ids
    }

    /// Number of distinct patterns with at least one subscriber.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Webhooks registered under exactly `pattern`.
    pub fn subscribers(&self, pattern: &str) -> Option<&HashSet<WebhookId>> {
        self.patterns.get(pattern).map(|entry| &entry.webhooks)
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::pattern_matches;
    use courier_test_utils::generators::{arb_event_type, arb_pattern};
    use uuid::Uuid;

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_exact_global_and_glob_resolution() {
        let mut index = SubscriptionIndex::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let c = Uuid::now_v7();
        index.subscribe(a, &strings(&["order.*"])).unwrap();
        index.subscribe(b, &strings(&["*"])).unwrap();
        index.subscribe(c, &strings(&["invoice.paid"])).unwrap();

        assert_eq!(index.candidates("order.created"), HashSet::from([a, b]));
        assert_eq!(index.candidates("invoice.created"), HashSet::from([b]));
        assert_eq!(index.candidates("invoice.paid"), HashSet::from([b, c]));
    }

    #[test]
    fn test_glob_requires_full_match() {
        let mut index = SubscriptionIndex::new();
        let a = Uuid::now_v7();
        index.subscribe(a, &strings(&["user.*"])).unwrap();
        assert!(index.candidates("user.created").contains(&a));
        assert!(index.candidates("admin.user.created").is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut index = SubscriptionIndex::new();
        let a = Uuid::now_v7();
        index.subscribe(a, &strings(&["order.*", "order.*"])).unwrap();
        index.subscribe(a, &strings(&["order.*"])).unwrap();
        assert_eq!(index.pattern_count(), 1);
        assert_eq!(index.subscribers("order.*").map(HashSet::len), Some(1));
    }

    #[test]
    fn test_unsubscribe_collects_empty_patterns() {
        let mut index = SubscriptionIndex::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        index.subscribe(a, &strings(&["order.*", "*"])).unwrap();
        index.subscribe(b, &strings(&["*"])).unwrap();

        index.unsubscribe(a, &strings(&["order.*", "*"]));
        assert_eq!(index.pattern_count(), 1);
        assert!(index.subscribers("order.*").is_none());
        assert_eq!(index.candidates("order.created"), HashSet::from([b]));
    }

    proptest::proptest! {
        #[test]
        fn prop_candidates_are_exactly_the_matching_webhooks(
            subscriptions in proptest::collection::vec(
                proptest::collection::vec(arb_pattern(), 1..4),
                1..8,
            ),
            event_type in arb_event_type(),
        ) {
            let mut index = SubscriptionIndex::new();
            let mut expected = HashSet::new();
            for patterns in &subscriptions {
                let id = Uuid::now_v7();
                index.subscribe(id, patterns).unwrap();
                if patterns.iter().any(|p| pattern_matches(p, &event_type)) {
                    expected.insert(id);
                }
            }
            proptest::prop_assert_eq!(index.candidates(&event_type), expected);
        }
    }

    #[test]
    fn test_invalid_pattern_leaves_index_untouched() {
        let mut index = SubscriptionIndex::new();
        let a = Uuid::now_v7();
        let result = index.subscribe(a, &strings(&["order.*", "bad pattern"]));
        assert!(result.is_err());
        assert_eq!(index.pattern_count(), 0);
    }
}
