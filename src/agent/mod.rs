//! The chat turn: a bounded, streaming tool-calling loop.
//!
//! ```text
//! persist user message → load history → resolve tools
//!   → model call ──(tool calls, rounds < max)──→ dispatch all → model call …
//!        └──(no tool calls, or tools withdrawn)──→ persist answer → done
//! ```
//!
//! Tools are offered for at most `max_tool_rounds` rounds; after that one
//! last call is made without tools, so a turn makes at most
//! `max_tool_rounds + 1` model calls. Tool failures become tool messages;
//! only model failures and a closed event stream end the turn early.

pub mod events;
pub mod sql_guard;
pub mod sub_agent;
pub mod tools;

use futures::StreamExt;
use uuid::Uuid;

use crate::error::{ToolError, TurnError};
use crate::llm::{ChatMessage, ChatRequest, StreamChunk, ToolCall, ToolSpec};
use crate::models::{now_ts, Message, Role, ToolCallRecord};
use crate::retrieval;
use crate::services::Session;
use events::{EventSink, StreamEvent};
use tools::{ToolInvocation, UserState};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to the user's \
uploaded documents.

IMPORTANT RULES:
- When the user asks about their documents or any topic that might be covered in them, ALWAYS use the search_documents tool first.
- Answer based strictly on the retrieved document content. Do NOT guess, infer, or add information beyond what the documents contain.
- If the search returns relevant results, quote or closely paraphrase the source material.
- If the search returns no results or irrelevant results, say so honestly.
- When multiple chunks are returned, synthesize them into a complete answer.
- Cite the source filename when referencing document content.

TOOL USAGE GUIDANCE:
- Use search_documents for finding specific information, answering questions about document content, or searching by topic. You can pass optional filters to narrow by document_type, language, or keywords.
- Use query_documents_sql for analytical questions like counts, listings, comparisons across documents (e.g. \"how many documents do I have?\", \"list my PDFs\", \"which documents mention X?\").
- Use analyze_document when the user wants deep analysis of a specific document (e.g. \"summarize document X in detail\", \"analyze the key findings in my report\"). This delegates to a sub-agent that reads the full document.";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub owner_id: String,
    pub thread_id: String,
    pub content: String,
}

/// Run one turn to completion, ending the event stream with `done` or
/// `error`. Returns the persisted assistant message, or `None` when the
/// turn failed or the consumer went away.
pub async fn run_turn(session: &Session, request: TurnRequest, sink: EventSink) -> Option<Message> {
    match drive_turn(session, &request, &sink).await {
        Ok(message) => {
            sink.finish(StreamEvent::Done).await;
            Some(message)
        }
        Err(TurnError::Cancelled) => {
            tracing::info!(thread = %request.thread_id, "turn cancelled by client");
            None
        }
        Err(e) => {
            tracing::error!(thread = %request.thread_id, error = %e, "turn failed");
            sink.finish(StreamEvent::Error {
                error: e.to_string(),
            })
            .await;
            None
        }
    }
}

async fn drive_turn(
    session: &Session,
    request: &TurnRequest,
    sink: &EventSink,
) -> Result<Message, TurnError> {
    let store = session.store.as_ref();
    let owner_id = request.owner_id.as_str();
    let agent_cfg = &session.config.agent;

    store
        .insert_message(&Message {
            id: Uuid::new_v4().to_string(),
            thread_id: request.thread_id.clone(),
            owner_id: owner_id.to_string(),
            role: Role::User,
            content: request.content.clone(),
            tool_calls: None,
            created_at: now_ts(),
        })
        .await?;

    let system_prompt = session
        .settings
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let mut messages = vec![ChatMessage::system(system_prompt)];
    for m in store.list_messages(owner_id, &request.thread_id).await? {
        messages.push(match m.role {
            Role::User => ChatMessage::user(m.content),
            Role::Assistant => ChatMessage::assistant(m.content),
        });
    }

    let state = UserState {
        completed_documents: store.count_completed_documents(owner_id).await?,
    };
    let tools = tools::resolve_tools(&state);
    tracing::info!(
        owner = owner_id,
        thread = %request.thread_id,
        completed_documents = state.completed_documents,
        tools = tools.len(),
        "chat turn started"
    );

    let mut rounds = 0usize;
    let mut audit: Vec<ToolCallRecord> = Vec::new();
    let answer = loop {
        let offer_tools = !tools.is_empty() && rounds < agent_cfg.max_tool_rounds;
        let offered: Vec<ToolSpec> = if offer_tools { tools.clone() } else { Vec::new() };
        let chat_request = ChatRequest::new(messages.clone()).with_tools(offered);

        let (text, calls) = stream_round(session, &chat_request, sink, offer_tools).await?;
        if calls.is_empty() || !offer_tools {
            break text;
        }

        rounds += 1;
        tracing::debug!(round = rounds, calls = calls.len(), "tool round");
        messages.push(ChatMessage::assistant_tool_calls(&text, calls.clone()));
        for call in &calls {
            let result = dispatch(session, owner_id, call, sink).await?;
            audit.push(ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result: result.chars().take(agent_cfg.audit_result_chars).collect(),
            });
            messages.push(ChatMessage::tool(call.id.clone(), result));
        }
    };

    if sink.is_closed() {
        return Err(TurnError::Cancelled);
    }
    let message = Message {
        id: Uuid::new_v4().to_string(),
        thread_id: request.thread_id.clone(),
        owner_id: owner_id.to_string(),
        role: Role::Assistant,
        content: answer,
        tool_calls: (!audit.is_empty()).then_some(audit),
        created_at: now_ts(),
    };
    store.insert_message(&message).await?;
    tracing::info!(thread = %request.thread_id, rounds, "chat turn completed");
    Ok(message)
}

/// One streamed model call. Without tools, text deltas are forwarded as
/// they arrive. With tools offered, deltas are held until the round ends
/// and only forwarded if it made no tool calls.
async fn stream_round(
    session: &Session,
    request: &ChatRequest,
    sink: &EventSink,
    offer_tools: bool,
) -> Result<(String, Vec<ToolCall>), TurnError> {
    let mut stream = session.chat.stream(request).await?;
    let mut text = String::new();
    let mut held: Vec<String> = Vec::new();
    let mut calls = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta(delta) => {
                text.push_str(&delta);
                if offer_tools {
                    held.push(delta);
                } else {
                    sink.send(StreamEvent::TextDelta { content: delta }).await?;
                }
            }
            StreamChunk::ToolCalls(mut batch) => calls.append(&mut batch),
        }
    }
    if calls.is_empty() {
        for delta in held {
            sink.send(StreamEvent::TextDelta { content: delta }).await?;
        }
    }
    Ok((text, calls))
}

/// Execute one tool call and return the text for its tool message.
async fn dispatch(
    session: &Session,
    owner_id: &str,
    call: &ToolCall,
    sink: &EventSink,
) -> Result<String, TurnError> {
    let invocation = match tools::parse_invocation(call) {
        Ok(inv) => inv,
        Err(e) => {
            tracing::warn!(tool = %call.name, error = %e, "bad tool call");
            return Ok(e.to_payload());
        }
    };

    let outcome = match invocation {
        ToolInvocation::Search { query, filter } => {
            let top_k = session.config.retrieval.default_top_k;
            retrieval::search(session, owner_id, &query, top_k, filter.as_ref())
                .await
                .map(|rows| retrieval::format_results(&rows))
                .map_err(ToolError::from)
        }
        ToolInvocation::Sql { question } => {
            sql_guard::run_sql_tool(session, owner_id, &question).await
        }
        ToolInvocation::Analyze { document_id, query } => {
            sub_agent::run_sub_agent(session, owner_id, &document_id, &query, sink).await?
        }
    };

    Ok(match outcome {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(tool = %call.name, error = %e, "tool returned an error");
            e.to_payload()
        }
    })
}
