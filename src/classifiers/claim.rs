//! Claim dimension: what kind of assertion the utterance makes.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["universal", "forecast", "normative"];

static FORECAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(will|going to|won't|about to|forecast|predict|expect(s|ed)?|by (q[1-4]|20\d\d|next|the end of))\b",
    )
    .expect("invalid regex")
});

static UNIVERSAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(all|every|none|no one|nobody|everyone|everything|always|never)\b.*\b(is|are|do|does|has|have|will)\b")
        .expect("invalid regex")
});

static NORMATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(should|must|ought to|have to|need to|supposed to)\b")
        .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let mut out = Vec::new();
    if FORECAST.is_match(last) {
        out.push(Classification::new("forecast", 0.8));
    }
    if UNIVERSAL.is_match(last) {
        out.push(Classification::new("universal", 0.75));
    }
    if NORMATIVE.is_match(last) {
        out.push(Classification::new("normative", 0.7));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    last.split_whitespace().count() >= 6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forecast() {
        let results = regex_pass("This will definitely double by Q4.", &[]);
        assert!(results.iter().any(|c| c.signal == "forecast"));
    }

    #[test]
    fn test_universal_needs_predicate() {
        assert!(regex_pass("All tests are green", &[])
            .iter()
            .any(|c| c.signal == "universal"));
        // A bare quantifier without a predicate is not a universal claim.
        assert!(!regex_pass("Find all test files in the project.", &[])
            .iter()
            .any(|c| c.signal == "universal"));
    }

    #[test]
    fn test_normative() {
        let results = regex_pass("We should migrate the database first", &[]);
        assert!(results.iter().any(|c| c.signal == "normative"));
    }

    #[test]
    fn test_gate_skips_short_input() {
        assert!(!gate("ok", &[]));
        assert!(gate("this claim has more than six whole words in it", &[]));
    }
}
