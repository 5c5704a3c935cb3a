//! LLM adapter contract and the HTTP provider implementation.

mod client;
mod types;

pub use client::{HttpLlmClient, LlmClient, ProviderConfig};
pub use types::{FinishReason, LlmRequest, LlmResponse, Usage};
