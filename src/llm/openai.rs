//! OpenAI-compatible chat completions client.
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! (OpenAI, OpenRouter, vLLM, Ollama's compatibility layer). Streaming
//! responses are read as server-sent events; tool-call fragments are
//! accumulated by index and emitted once the stream ends.
//!
//! Retry strategy matches the embedding clients: HTTP 429 and 5xx are
//! retried with exponential backoff (1s, 2s, 4s, … capped at 32s), other
//! 4xx fail immediately, network errors are retried.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use super::{
    ChatCompletion, ChatMessage, ChatModel, ChatRequest, ChatRole, ChatStream, LlmError,
    StreamChunk, ToolCall,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
}

impl OpenAiChatModel {
    pub fn new(
        model: impl Into<String>,
        base_url: Option<&str>,
        api_key: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
            max_retries,
        })
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_json).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(format) = &request.response_format {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                    "strict": true,
                }
            });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = LlmError::Api {
                        status: status.as_u16(),
                        body: body_text,
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, status = status.as_u16(), "chat completion retryable error");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "chat completion transport error");
                    last_err = Some(LlmError::Transport(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Transport("retries exhausted".to_string())))
    }
}

fn message_json(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut out = json!({
        "role": role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })
            })
            .collect();
        out["tool_calls"] = Value::Array(calls);
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Deserialize)]
struct DeltaToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Tool-call fragments keyed by their stream index.
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<usize, ToolCall>,
}

impl ToolCallAssembler {
    fn push(&mut self, fragment: DeltaToolCall) {
        let entry = self.calls.entry(fragment.index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            entry.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                entry.name = name;
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

/// Turn an SSE byte stream from `/chat/completions` into [`StreamChunk`]s.
pub fn parse_sse_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamChunk, LlmError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut assembler = ToolCallAssembler::default();
        let mut finished = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    finished = true;
                    break;
                }
                let parsed: StreamResponse = serde_json::from_str(data)
                    .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
                for choice in parsed.choices {
                    let Some(delta) = choice.delta else { continue };
                    if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                        yield StreamChunk::TextDelta(text);
                    }
                    for fragment in delta.tool_calls.unwrap_or_default() {
                        assembler.push(fragment);
                    }
                }
            }
            if finished {
                break;
            }
        }

        let calls = assembler.finish();
        if !calls.is_empty() {
            yield StreamChunk::ToolCalls(calls);
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let body = self.request_body(request, false);
        let response = self.post(&body).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?
            .message;
        Ok(ChatCompletion {
            content: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let body = self.request_body(request, true);
        let response = self.post(&body).await?;
        tracing::debug!(model = %self.model, "chat completion stream opened");
        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;

    fn sse(lines: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        lines
            .iter()
            .map(|l| Ok(format!("data: {}\n\n", l).into_bytes()))
            .collect()
    }

    async fn collect(chunks: Vec<Result<Vec<u8>, String>>) -> Vec<Result<StreamChunk, LlmError>> {
        parse_sse_stream(futures::stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_text_deltas_in_order() {
        let out = collect(sse(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            "[DONE]",
        ]))
        .await;
        let texts: Vec<String> = out
            .into_iter()
            .map(|r| match r.unwrap() {
                StreamChunk::TextDelta(t) => t,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_tool_call_fragments_assembled() {
        let out = collect(sse(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search_documents","arguments":"{\"qu"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ery\":\"x\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]))
        .await;
        assert_eq!(out.len(), 1);
        match out.into_iter().next().unwrap().unwrap() {
            StreamChunk::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "call_1");
                assert_eq!(calls[0].name, "search_documents");
                assert_eq!(calls[0].arguments, "{\"query\":\"x\"}");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_split_across_network_chunks() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: [DONE]\n\n";
        let (a, b) = raw.split_at(17);
        let out = collect(vec![Ok(a.as_bytes().to_vec()), Ok(b.as_bytes().to_vec())]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out.into_iter().next().unwrap().unwrap(),
            StreamChunk::TextDelta("ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let out = collect(vec![Err("reset by peer".to_string())]).await;
        assert!(matches!(out[0], Err(LlmError::Transport(_))));
    }

    #[test]
    fn test_request_body_includes_tools_and_schema() {
        let model =
            OpenAiChatModel::new("gpt-4o", None, None, Duration::from_secs(5), 0).unwrap();
        let request = ChatRequest::new(vec![ChatMessage::user("hi")])
            .with_tools(vec![ToolSpec {
                name: "search_documents".to_string(),
                description: "Search".to_string(),
                parameters: json!({"type": "object"}),
            }])
            .with_json_schema("answer", json!({"type": "object"}))
            .with_max_tokens(50);
        let body = model.request_body(&request, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "search_documents");
        assert_eq!(body["response_format"]["json_schema"]["name"], "answer");
        assert_eq!(body["max_tokens"], 50);
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let v = message_json(&ChatMessage::tool("call_9", "result"));
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_9");
    }
}
