//! Request and response types for the LLM adapter contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::thread::{Message, ToolCallRequest};
use crate::tools::ToolDef;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Safety,
    Other,
}

/// Token usage for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt: u64,
    pub completion: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

/// A completion request handed to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub thread: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, thread: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            thread,
            max_tokens,
            temperature: None,
            tools: None,
            response_format: None,
            stop: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
        }
        self
    }

    pub fn with_response_format(mut self, format: Value) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// A completion response returned by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: String,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl LlmResponse {
    /// A plain text response, mostly for tests and scripted clients.
    pub fn text(output: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            usage: Usage::default(),
            model: model.into(),
            finish_reason: FinishReason::EndTurn,
            tool_calls: None,
        }
    }

    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.usage = Usage { prompt, completion };
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRequest>) -> Self {
        self.finish_reason = FinishReason::ToolUse;
        self.tool_calls = Some(calls);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Message;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let req = LlmRequest::new("m", vec![Message::user("hi")], 500)
            .with_temperature(1.7)
            .with_stop(vec!["END".into()]);
        assert_eq!(req.max_tokens, 500);
        assert_eq!(req.temperature, Some(1.0));
        assert_eq!(req.stop.as_ref().unwrap()[0], "END");
    }

    #[test]
    fn test_empty_tools_elided() {
        let req = LlmRequest::new("m", vec![], 100).with_tools(vec![]);
        assert!(req.tools.is_none());
    }

    #[test]
    fn test_response_tool_calls_flip_finish_reason() {
        let resp = LlmResponse::text("", "m").with_tool_calls(vec![ToolCallRequest::new(
            "c1",
            "search",
            json!({"q": "x"}),
        )]);
        assert_eq!(resp.finish_reason, FinishReason::ToolUse);
        assert!(resp.has_tool_calls());
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage {
            prompt: 120,
            completion: 30,
        };
        assert_eq!(usage.total(), 150);
    }
}
