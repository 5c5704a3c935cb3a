//! LLM client trait and the HTTP provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::thread::{Message, Role, ToolCallRequest};

use super::types::{FinishReason, LlmRequest, LlmResponse, Usage};

/// The adapter contract every provider implements.
///
/// The cancellation token is forwarded so in-flight HTTP calls abort when
/// the turn is interrupted. All transport and provider failures must be
/// surfaced as [`Error::Provider`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest, cancel: &CancelToken) -> Result<LlmResponse>;

    /// Provider name used in error messages and provenance.
    fn provider(&self) -> &str;
}

/// Configuration for the HTTP provider client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Base URL override, mainly for tests and proxies
    pub base_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Anthropic-style messages API client.
pub struct HttpLlmClient {
    config: ProviderConfig,
    http: Client,
}

impl HttpLlmClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const PROVIDER: &'static str = "anthropic";

    pub fn new(config: ProviderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn build_wire_request(&self, request: &LlmRequest) -> WireRequest {
        let mut system = None;
        let mut messages: Vec<WireMessage> = Vec::new();

        for msg in &request.thread {
            match msg.role {
                Role::System => {
                    // First system message becomes the top-level system
                    // field; later ones fold into the conversation.
                    if system.is_none() {
                        system = Some(msg.content.clone());
                    } else {
                        messages.push(WireMessage::user(msg.content.clone()));
                    }
                }
                Role::User => messages.push(WireMessage::user(msg.content.clone())),
                Role::Assistant => messages.push(WireMessage::assistant(msg)),
                Role::Tool => {
                    let tool = msg.name.as_deref().unwrap_or("tool");
                    messages.push(WireMessage::user(format!(
                        "[tool_result:{}]\n{}",
                        tool, msg.content
                    )));
                }
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| WireTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect()
        });

        WireRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system,
            messages,
            temperature: request.temperature,
            stop_sequences: request.stop.clone(),
            tools,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest, cancel: &CancelToken) -> Result<LlmResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let wire = self.build_wire_request(&request);
        let url = format!("{}/v1/messages", self.base_url());

        let send = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&wire)
            .send();

        let response = tokio::select! {
            resp = send => resp.map_err(|e| {
                Error::provider(Self::PROVIDER, format!("HTTP request failed: {}", e))
            })?,
            _ = cancel.cancelled() => return Err(Error::Interrupted),
        };

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::provider(Self::PROVIDER, format!("failed to read response: {}", e))
        })?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<WireError>(&body) {
                return Err(Error::provider(
                    Self::PROVIDER,
                    format!("{}: {}", err.error.error_type, err.error.message),
                ));
            }
            return Err(Error::provider(
                Self::PROVIDER,
                format!("status {}: {}", status, body),
            ));
        }

        let wire: WireResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(Self::PROVIDER, format!("failed to parse response: {}", e))
        })?;

        let mut output = String::new();
        let mut tool_calls = Vec::new();
        for block in &wire.content {
            match block {
                WireBlock::Text { text } => output.push_str(text),
                WireBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCallRequest::new(id.clone(), name.clone(), input.clone()));
                }
                WireBlock::Other => {}
            }
        }

        let finish_reason = match wire.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::EndTurn,
            Some("max_tokens") => FinishReason::MaxTokens,
            Some("tool_use") => FinishReason::ToolUse,
            Some("refusal") => FinishReason::Safety,
            _ => FinishReason::Other,
        };

        Ok(LlmResponse {
            output,
            usage: Usage {
                prompt: wire.usage.input_tokens,
                completion: wire.usage.output_tokens,
            },
            model: wire.model,
            finish_reason,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        })
    }

    fn provider(&self) -> &str {
        Self::PROVIDER
    }
}

// Wire types for the messages endpoint.

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireContent>,
}

impl WireMessage {
    fn user(text: String) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![WireContent::Text { text }],
        }
    }

    fn assistant(msg: &Message) -> Self {
        let mut content = Vec::new();
        if !msg.content.is_empty() {
            content.push(WireContent::Text {
                text: msg.content.clone(),
            });
        }
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                content.push(WireContent::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
        }
        if content.is_empty() {
            content.push(WireContent::Text {
                text: String::new(),
            });
        }
        Self {
            role: "assistant".to_string(),
            content,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: String,
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDef;
    use serde_json::json;

    fn client() -> HttpLlmClient {
        HttpLlmClient::new(ProviderConfig::new("test-key"))
    }

    #[test]
    fn test_system_message_extracted() {
        let request = LlmRequest::new(
            "m",
            vec![Message::system("be brief"), Message::user("hi")],
            100,
        );
        let wire = client().build_wire_request(&request);
        assert_eq!(wire.system.as_deref(), Some("be brief"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn test_tool_result_folds_to_user() {
        let request = LlmRequest::new(
            "m",
            vec![
                Message::user("do it"),
                Message::assistant("").with_tool_calls(vec![ToolCallRequest::new(
                    "c1",
                    "search",
                    json!({"q": "x"}),
                )]),
                Message::tool("search", "3 hits"),
            ],
            100,
        );
        let wire = client().build_wire_request(&request);
        assert_eq!(wire.messages.len(), 3);
        assert_eq!(wire.messages[1].role, "assistant");
        assert_eq!(wire.messages[2].role, "user");
        match &wire.messages[2].content[0] {
            WireContent::Text { text } => {
                assert!(text.starts_with("[tool_result:search]"));
                assert!(text.contains("3 hits"));
            }
            other => panic!("expected text block, got {:?}", other),
        }
    }

    #[test]
    fn test_tools_mapped() {
        let request = LlmRequest::new("m", vec![Message::user("hi")], 100).with_tools(vec![
            ToolDef::new("search", "find things", json!({"type": "object"})),
        ]);
        let wire = client().build_wire_request(&request);
        let tools = wire.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }

    #[test]
    fn test_response_parsing() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.rs"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let wire: WireResponse = serde_json::from_value(body).unwrap();
        assert_eq!(wire.content.len(), 2);
        assert_eq!(wire.usage.input_tokens, 12);
        assert_eq!(wire.stop_reason.as_deref(), Some("tool_use"));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = client()
            .complete(LlmRequest::new("m", vec![Message::user("hi")], 10), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
