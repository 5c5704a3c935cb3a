//! Final error recovery: a coded, graceful response for any error that
//! escapes plan execution.

use std::sync::Arc;

use serde_json::json;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorCode};
use crate::llm::{LlmClient, LlmRequest};
use crate::thread::Message;

use super::TurnResponse;

const RECOVERY_MAX_TOKENS: u32 = 150;

const RECOVERY_SYSTEM: &str = "A step in handling the user's request failed. Produce a short, \
graceful reply: acknowledge that the request could not be completed, state the reason in plain \
language, and suggest retrying or simplifying. Do not invent results.";

/// Produces the turn's response when execution failed.
pub struct FallbackExecutor {
    llm: Option<Arc<dyn LlmClient>>,
    model: String,
}

impl FallbackExecutor {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            llm: None,
            model: model.into(),
        }
    }

    /// Enable the small recovery LLM call.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Build the coded fallback response for an error.
    ///
    /// When a provider is reachable and the failure wasn't the provider
    /// itself (or an interrupt), one small recovery call produces the
    /// wording; otherwise the static bullet list is returned.
    pub async fn recover(&self, error: &Error, cancel: &CancelToken) -> TurnResponse {
        let code = error.code();
        let description = describe(code);
        tracing::warn!(code = %code, error = %error, "falling back");

        let attempt_recovery = self.llm.is_some()
            && code != ErrorCode::Provider
            && code != ErrorCode::Abort
            && !cancel.is_cancelled();

        let output = if attempt_recovery {
            let llm = self.llm.as_ref().expect("llm presence checked above");
            let request = LlmRequest::new(
                self.model.clone(),
                vec![
                    Message::system(RECOVERY_SYSTEM),
                    Message::user(format!("What went wrong: {}", description)),
                ],
                RECOVERY_MAX_TOKENS,
            );
            match llm.complete(request, cancel).await {
                Ok(response) => response.output,
                Err(recovery_err) => {
                    tracing::debug!(error = %recovery_err, "recovery call failed, using static response");
                    static_response(code, description)
                }
            }
        } else {
            static_response(code, description)
        };

        let mut turn = TurnResponse::new(output);
        turn.metadata.insert("fallback".to_string(), json!(true));
        turn.metadata
            .insert("error_code".to_string(), json!(code.as_str()));
        turn.metadata.insert("recovered".to_string(), json!(true));
        if code == ErrorCode::Abort {
            turn.metadata.insert("interrupted".to_string(), json!(true));
        }
        turn
    }
}

fn describe(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Depth => "The plan nested deeper than the configured limit.",
        ErrorCode::Fanout => "A parallel plan requested more branches than allowed.",
        ErrorCode::Children => "A sequential plan had more steps than allowed.",
        ErrorCode::Provider => "The language model provider could not be reached.",
        ErrorCode::Timeout => "The task ran out of time.",
        ErrorCode::Abort => "The operation was interrupted.",
        ErrorCode::Schema => "A component produced output that failed validation.",
        ErrorCode::RuleLoop => "Rule evaluation did not settle within its cycle limit.",
        ErrorCode::Unknown => "An unexpected error occurred.",
    }
}

fn static_response(code: ErrorCode, description: &str) -> String {
    format!(
        "- The request could not be completed.\n\
         - {}\n\
         - Error code: {}\n\
         - You can retry, rephrase, or simplify the request.",
        description, code
    )
}
