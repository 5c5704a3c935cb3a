//! Support dimension: what evidence accompanies the utterance.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["source-cited", "anecdote", "unsupported"];

static SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://|according to|\bstudy\b|\breport\b|\bpaper\b|\[\d+\]|doi:)")
        .expect("invalid regex")
});

static ANECDOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(in my experience|i once|we saw|i'?ve seen|anecdot|last time (we|i))\b")
        .expect("invalid regex")
});

static ASSERTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(will|always|never|definitely|clearly|obviously|certainly)\b")
        .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let mut out = Vec::new();
    let cited = SOURCE.is_match(last);
    let anecdotal = ANECDOTE.is_match(last);
    if cited {
        out.push(Classification::new("source-cited", 0.8));
    }
    if anecdotal {
        out.push(Classification::new("anecdote", 0.75));
    }
    if !cited && !anecdotal && ASSERTIVE.is_match(last) {
        out.push(Classification::new("unsupported", 0.65));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    ASSERTIVE.is_match(last) || SOURCE.is_match(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_cited() {
        let results = regex_pass("According to the Q3 report, churn fell.", &[]);
        assert!(results.iter().any(|c| c.signal == "source-cited"));
        assert!(!results.iter().any(|c| c.signal == "unsupported"));
    }

    #[test]
    fn test_unsupported_assertion() {
        let results = regex_pass("This will definitely double by Q4.", &[]);
        assert!(results.iter().any(|c| c.signal == "unsupported"));
    }

    #[test]
    fn test_anecdote() {
        let results = regex_pass("In my experience the cache is the problem.", &[]);
        assert!(results.iter().any(|c| c.signal == "anecdote"));
    }

    #[test]
    fn test_neutral_text_emits_nothing() {
        assert!(regex_pass("What time is the meeting?", &[]).is_empty());
    }
}
