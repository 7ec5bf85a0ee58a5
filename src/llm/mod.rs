//! Chat-completion provider abstraction.
//!
//! Defines the [`ChatModel`] trait and the request/response types shared by
//! every caller that talks to an LLM: the chat loop, the sub-agent, HyDE,
//! reranking, SQL generation, contextualization and metadata extraction.
//!
//! - [`openai::OpenAiChatModel`] speaks the OpenAI-compatible
//!   `/chat/completions` API, streaming over SSE.
//! - [`mock::ScriptedChatModel`] replays canned completions for tests.
//! - [`DisabledChatModel`] fails every call; used when `llm.provider =
//!   "disabled"`.

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("chat model is disabled")]
    Disabled,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` messages: the call this message answers.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    /// The assistant turn that requested `calls`. Content is dropped when
    /// empty so providers do not see a blank string next to tool calls.
    pub fn assistant_tool_calls(content: &str, calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: (!content.is_empty()).then(|| content.to_string()),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A function the model may call, described with a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Structured-output contract for a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchema {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub response_format: Option<JsonSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_json_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.response_format = Some(JsonSchema {
            name: name.into(),
            schema,
        });
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    /// All tool calls of the completion, fully assembled. Emitted once, at
    /// the end of the stream.
    ToolCalls(Vec<ToolCall>),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError>;

    /// Stream a completion. The default replays [`ChatModel::complete`] as
    /// a single text delta followed by any tool calls.
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let completion = self.complete(request).await?;
        let mut items = Vec::new();
        if !completion.content.is_empty() {
            items.push(Ok(StreamChunk::TextDelta(completion.content)));
        }
        if !completion.tool_calls.is_empty() {
            items.push(Ok(StreamChunk::ToolCalls(completion.tool_calls)));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Run a structured completion and decode its content into `T`.
pub async fn complete_json<T: DeserializeOwned>(
    model: &dyn ChatModel,
    request: &ChatRequest,
) -> Result<T, LlmError> {
    let completion = model.complete(request).await?;
    parse_json_content(&completion.content)
}

/// Decode model output as JSON, tolerating a surrounding markdown fence.
pub fn parse_json_content<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))
}

/// Chat model used when no provider is configured.
pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        Err(LlmError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Debug, Deserialize)]
    struct Answer {
        value: i64,
    }

    #[test]
    fn test_parse_plain_json() {
        let a: Answer = parse_json_content("{\"value\": 3}").unwrap();
        assert_eq!(a.value, 3);
    }

    #[test]
    fn test_parse_fenced_json() {
        let a: Answer = parse_json_content("```json\n{\"value\": 7}\n```").unwrap();
        assert_eq!(a.value, 7);
    }

    #[test]
    fn test_parse_garbage_is_invalid_response() {
        let err = parse_json_content::<Answer>("not json").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn test_assistant_tool_calls_drops_empty_content() {
        let msg = ChatMessage::assistant_tool_calls("", vec![]);
        assert!(msg.content.is_none());
        assert_eq!(msg.role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn test_default_stream_replays_completion() {
        let model = mock::ScriptedChatModel::new(vec![ChatCompletion {
            content: "hello".to_string(),
            tool_calls: vec![],
        }]);
        let mut stream = model.stream(&ChatRequest::default()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, StreamChunk::TextDelta("hello".to_string()));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_model_errors() {
        let err = DisabledChatModel
            .complete(&ChatRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Disabled));
    }
}
