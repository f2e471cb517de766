//! Word-overlap similarity

use std::collections::HashSet;

/// Jaccard similarity of the word sets of `a` and `b`
///
/// Words are lowercase, whitespace-separated and longer than two
/// characters. Two empty sets are identical; one empty set shares nothing.
#[must_use]
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a = words(a);
    let b = words(b);
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        (false, false) => {}
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = shared as f64 / union as f64;
    ratio
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn overlap_is_shared_over_union() {
        assert!((jaccard("regex attempt", "use regex") - 1.0 / 3.0).abs() < 1e-9);
        assert!((jaccard("regex attempt", "try regex again") - 0.25).abs() < 1e-9);
    }

    #[test]
    fn case_and_short_words_are_ignored() {
        assert!((jaccard("Fix THE parser", "fix the PARSER to") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_sets() {
        assert!((jaccard("", "a b") - 1.0).abs() < 1e-9);
        assert!(jaccard("", "rewrite module").abs() < 1e-9);
        assert!(jaccard("rewrite module", "to").abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn similarity_is_bounded_and_symmetric(a in "[a-z ]{0,40}", b in "[a-z ]{0,40}") {
            let ab = jaccard(&a, &b);
            let ba = jaccard(&b, &a);
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-12);
        }

        #[test]
        fn text_is_identical_to_itself(a in "[a-z ]{0,40}") {
            prop_assert!((jaccard(&a, &a) - 1.0).abs() < 1e-12);
        }
    }
}
