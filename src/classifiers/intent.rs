//! Intent dimension: what the user wants done.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["investigate", "execute", "question"];

static INVESTIGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(find|locate|search|look (for|into)|where (is|are)|which (files?|ones?)|list (all|the)|investigate|track down|dig into)\b",
    )
    .expect("invalid regex")
});

static EXECUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(create|write|make|add|update|modify|delete|remove|rename|move|run|execute|install|deploy|fix)\b",
    )
    .expect("invalid regex")
});

static QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(what|why|how|when|who|where|is|are|can|could|does|do|did|should)\b")
        .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let mut out = Vec::new();
    if INVESTIGATE.is_match(last) {
        out.push(Classification::new("investigate", 0.75));
    }
    if EXECUTE.is_match(last) {
        out.push(Classification::new("execute", 0.8));
    }
    if QUESTION.is_match(last.trim()) || last.trim_end().ends_with('?') {
        out.push(Classification::new("question", 0.7));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    last.split_whitespace().count() >= 3
}
