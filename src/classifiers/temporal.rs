//! Temporal dimension: whether the utterance carries a time horizon.

use regex::Regex;
use std::sync::LazyLock;

use super::Classification;

pub(super) const SIGNALS: &[&str] = &["time-specified", "no-horizon"];

static TIME_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(by (q[1-4]|20\d\d|eod|eow|monday|tuesday|wednesday|thursday|friday)|today|tomorrow|tonight|next (week|month|quarter|year)|this (week|month|quarter|year)|deadline|due (by|on)|within \d+)\b",
    )
    .expect("invalid regex")
});

static FUTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(will|going to|plan(s|ning)? to|eventually|soon|later)\b")
        .expect("invalid regex")
});

pub(super) fn regex_pass(last: &str, _context: &[&str]) -> Vec<Classification> {
    let mut out = Vec::new();
    let timed = TIME_MARKER.is_match(last);
    if timed {
        out.push(Classification::new("time-specified", 0.8));
    } else if FUTURE.is_match(last) {
        out.push(Classification::new("no-horizon", 0.65));
    }
    out
}

pub(super) fn gate(last: &str, _context: &[&str]) -> bool {
    FUTURE.is_match(last) || TIME_MARKER.is_match(last)
}
