//! Calibration dimension: how certain the utterance sounds.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["high-certainty", "hedged"];

static HIGH_CERTAINTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(definitely|certainly|obviously|clearly|no doubt|without question|guaranteed|100%)\b",
    )
    .expect("invalid regex")
});

static HEDGED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(might|maybe|perhaps|possibly|i think|i guess|not sure|could be|seems like|probably)\b",
    )
    .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let mut out = Vec::new();
    if HIGH_CERTAINTY.is_match(last) {
        out.push(Classification::new("high-certainty", 0.85));
    }
    if HEDGED.is_match(last) {
        out.push(Classification::new("hedged", 0.75));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    last.split_whitespace().count() >= 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_certainty() {
        let results = regex_pass("This will definitely double by Q4.", &[]);
        assert!(results
            .iter()
            .any(|c| c.signal == "high-certainty" && c.confidence >= 0.8));
    }

    #[test]
    fn test_hedged() {
        let results = regex_pass("maybe we should try the other branch", &[]);
        assert!(results.iter().any(|c| c.signal == "hedged"));
    }

    #[test]
    fn test_both_can_fire() {
        // "definitely... I think" is contradictory but both markers exist.
        let results = regex_pass("It's definitely broken, I think", &[]);
        assert_eq!(results.len(), 2);
    }
}
