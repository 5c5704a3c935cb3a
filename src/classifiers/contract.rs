//! Contract dimension: what kind of response the utterance implicitly asks for.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["ack-only", "capture-only", "explore", "analyze"];

/// Ack-style inputs at or below this length skip LLM enhancement.
/// A heuristic carried from the original rule set, not a contract.
const ACK_MAX_LEN: usize = 20;

static ACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(ok(ay)?|k|kk|thanks|thank you|thx|ty|got it|sounds good|cool|great|nice|sure|yep|yeah|yes|no|nope|ack|noted|done|perfect|will do|np)[.!\s]*$",
    )
    .expect("invalid regex")
});

static CAPTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(note|remember|jot|log|capture|save)( that| this| down)?\b")
        .expect("invalid regex")
});

static EXPLORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(explore|brainstorm|what are (the|some) (options|ways|angles)|think through|open questions?)\b",
    )
    .expect("invalid regex")
});

static ANALYZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(analy[sz]e|compare|evaluate|assess|weigh|trade-?offs?|pros and cons)\b")
        .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let trimmed = last.trim();
    let mut out = Vec::new();
    if trimmed.len() <= ACK_MAX_LEN && ACK.is_match(trimmed) {
        out.push(Classification::new("ack-only", 0.85));
    }
    if CAPTURE.is_match(trimmed) {
        out.push(Classification::new("capture-only", 0.75));
    }
    if EXPLORE.is_match(last) {
        out.push(Classification::new("explore", 0.7));
    }
    if ANALYZE.is_match(last) {
        out.push(Classification::new("analyze", 0.7));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    // Short ack-style input is unambiguous; the model adds nothing.
    last.trim().len() > ACK_MAX_LEN
}
