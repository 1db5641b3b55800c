mod openai_compat;
pub mod types;

pub use openai_compat::OpenAiCompatProvider;
pub use types::{ContentPart, ImageUrl, LlmResponse, Message, ToolCall, ToolDefinition, UsageInfo};

use anyhow::Result;
use async_trait::async_trait;

/// An opaque chat-completion service with token-usage reporting.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<LlmResponse>;

    fn default_model(&self) -> &str;
}
