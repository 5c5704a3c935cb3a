//! LLM enhancement pass for dimension classifiers.
//!
//! One short completion per gated dimension, with a strict JSON contract.
//! Entries naming unknown signals or confidences outside [0.6, 1.0] are
//! rejected during parsing; a fully unparseable body is a schema error the
//! caller downgrades to a debug log.

use serde::Deserialize;
use serde_json::json;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fact::{Dimension, MAX_CONFIDENCE, MIN_CONFIDENCE};
use crate::llm::{LlmClient, LlmRequest};
use crate::thread::Message;

use super::Classification;

const ENHANCEMENT_MAX_TOKENS: u32 = 200;

#[derive(Debug, Deserialize)]
struct Detected {
    detected: Vec<DetectedEntry>,
}

#[derive(Debug, Deserialize)]
struct DetectedEntry {
    signal: String,
    confidence: f64,
}

pub(super) async fn enhance(
    llm: &dyn LlmClient,
    model: &str,
    dimension: Dimension,
    signals: &[&str],
    last: &str,
    context: &[&str],
    cancel: &CancelToken,
) -> Result<Vec<Classification>> {
    let system = format!(
        "You classify a user utterance on the '{}' dimension.\n\
         Allowed signals: {}.\n\
         Respond with JSON only, no prose:\n\
         {{\"detected\": [{{\"signal\": \"<name>\", \"confidence\": <0.6-1.0>}}]}}\n\
         Omit signals you do not detect. Use an empty list when nothing applies.",
        dimension.as_str(),
        signals.join(", ")
    );

    let mut user = String::new();
    if !context.is_empty() {
        user.push_str("Recent context:\n");
        for line in context {
            user.push_str("- ");
            user.push_str(line);
            user.push('\n');
        }
        user.push('\n');
    }
    user.push_str("Utterance:\n");
    user.push_str(last);

    let request = LlmRequest::new(
        model,
        vec![Message::system(system), Message::user(user)],
        ENHANCEMENT_MAX_TOKENS,
    )
    .with_temperature(0.0)
    .with_response_format(json!({"type": "json"}));

    let response = llm.complete(request, cancel).await?;
    parse_detected(&response.output, signals)
}

/// Parse the enhancement body, keeping only entries in the dimension's
/// signal set with an in-range confidence.
pub(super) fn parse_detected(output: &str, signals: &[&str]) -> Result<Vec<Classification>> {
    let body = extract_json(output)
        .ok_or_else(|| Error::schema("enhancement response contained no JSON object"))?;
    let parsed: Detected = serde_json::from_str(body)
        .map_err(|e| Error::schema(format!("enhancement response malformed: {}", e)))?;

    Ok(parsed
        .detected
        .into_iter()
        .filter(|entry| {
            signals.contains(&entry.signal.as_str())
                && (MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&entry.confidence)
        })
        .map(|entry| Classification::new(entry.signal, entry.confidence))
        .collect())
}

/// Tolerate prose around the JSON object; models sometimes wrap it.
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNALS: &[&str] = &["forecast", "universal", "normative"];

    #[test]
    fn test_parse_valid_response() {
        let body = r#"{"detected": [{"signal": "forecast", "confidence": 0.9}]}"#;
        let parsed = parse_detected(body, SIGNALS).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].signal, "forecast");
        assert_eq!(parsed[0].confidence, 0.9);
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let body = r#"{"detected": [{"signal": "sarcasm", "confidence": 0.9}]}"#;
        assert!(parse_detected(body, SIGNALS).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let body = r#"{"detected": [
            {"signal": "forecast", "confidence": 0.4},
            {"signal": "universal", "confidence": 1.3},
            {"signal": "normative", "confidence": 0.7}
        ]}"#;
        let parsed = parse_detected(body, SIGNALS).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].signal, "normative");
    }

    #[test]
    fn test_wrapped_json_extracted() {
        let body = "Here is the classification:\n{\"detected\": []}\nDone.";
        assert!(parse_detected(body, SIGNALS).unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_schema_error() {
        assert!(matches!(
            parse_detected("no json here", SIGNALS),
            Err(Error::Schema(_))
        ));
        assert!(matches!(
            parse_detected("{\"detected\": \"oops\"}", SIGNALS),
            Err(Error::Schema(_))
        ));
    }
}
