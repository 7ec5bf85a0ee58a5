//! Deterministic chat model for tests and offline runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ChatCompletion, ChatModel, ChatRequest, LlmError, ToolCall};

type Handler = Box<dyn Fn(&ChatRequest) -> Result<ChatCompletion, LlmError> + Send + Sync>;

/// Replays a queue of scripted completions in order, then falls back to a
/// handler (if any). Every request is recorded for later inspection.
pub struct ScriptedChatModel {
    script: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatModel {
    pub fn new(script: Vec<ChatCompletion>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model whose answer is computed from each request.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<ChatCompletion, LlmError> + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that always answers with the same text.
    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::with_handler(move |_| Ok(ChatCompletion::text(&text)))
    }

    /// A model whose every call fails as if the provider were unreachable.
    pub fn unreachable() -> Self {
        Self::with_handler(|_| Err(LlmError::Transport("connection refused".to_string())))
    }

    /// Queue an error to be returned by the next unscripted call.
    pub fn push_error(&self, err: LlmError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ChatCompletion {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.handler {
            Some(handler) => handler(request),
            None => Err(LlmError::InvalidResponse(
                "scripted model has no more completions".to_string(),
            )),
        }
    }
}
