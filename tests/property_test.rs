//! Property-based tests for subject matching
//!
//! Uses proptest to generate random subjects and filters and verify the
//! wildcard rules hold across inputs the unit tests do not enumerate.

use leaf_extension::broker::subject::{matches, validate_filter, validate_literal};
use proptest::prelude::*;

/// Strategy to generate a single literal token
fn token() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,8}"
}

/// Strategy to generate a literal subject of 1..6 tokens
fn tokens() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(token(), 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: a literal subject is a valid filter that matches itself
    #[test]
    fn literal_matches_itself(parts in tokens()) {
        let subject = parts.join(".");
        prop_assert!(validate_literal(&subject).is_ok());
        prop_assert!(validate_filter(&subject).is_ok());
        prop_assert!(matches(&subject, &subject));
    }

    /// Property: `>` matches every subject
    #[test]
    fn full_wildcard_matches_everything(parts in tokens()) {
        prop_assert!(matches(">", &parts.join(".")));
    }

    /// Property: replacing any tokens with `*` keeps the match
    #[test]
    fn star_replacement_still_matches(
        parts in tokens(),
        mask in prop::collection::vec(any::<bool>(), 6)
    ) {
        let subject = parts.join(".");
        let filter: Vec<&str> = parts
            .iter()
            .zip(mask.iter())
            .map(|(part, star)| if *star { "*" } else { part.as_str() })
            .collect();
        let filter = filter.join(".");
        prop_assert!(validate_filter(&filter).is_ok());
        prop_assert!(matches(&filter, &subject));
    }

    /// Property: `*` never spans a different number of tokens
    #[test]
    fn star_requires_equal_token_count(parts in tokens(), extra in token()) {
        let filter = vec!["*"; parts.len()].join(".");
        let longer = format!("{}.{}", parts.join("."), extra);
        prop_assert!(matches(&filter, &parts.join(".")));
        prop_assert!(!matches(&filter, &longer));
    }

    /// Property: `prefix.>` matches strictly longer subjects, never the prefix itself
    #[test]
    fn tail_wildcard_needs_one_more_token(prefix in tokens(), rest in tokens()) {
        let filter = format!("{}.>", prefix.join("."));
        let subject = format!("{}.{}", prefix.join("."), rest.join("."));
        prop_assert!(matches(&filter, &subject));
        prop_assert!(!matches(&filter, &prefix.join(".")));
    }

    /// Property: subjects containing wildcards are never valid publish subjects
    #[test]
    fn wildcards_are_not_literals(parts in tokens(), index in 0usize..6, tail in any::<bool>()) {
        let mut parts = parts;
        let index = index % parts.len();
        parts[index] = if tail { ">".to_string() } else { "*".to_string() };
        prop_assert!(validate_literal(&parts.join(".")).is_err());
    }
}
