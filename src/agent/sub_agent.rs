//! Whole-document analysis delegated to a second model call.
//!
//! Unlike search, which sees a handful of chunks, the sub-agent reads the
//! entire document (up to a character cap) and answers one question about
//! it. Progress is reported on the turn's event stream.

use super::events::{EventSink, StreamEvent};
use crate::error::{ToolError, TurnError};
use crate::llm::{ChatMessage, ChatRequest};
use crate::services::Session;

const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

/// Outcome of one tool call. Only a closed event stream aborts the turn.
pub type ToolOutcome = Result<String, ToolError>;

/// Run the sub-agent. Emits exactly one `sub_agent_start` and one
/// `sub_agent_result`; the result event carries the same text that
/// becomes the tool result.
pub async fn run_sub_agent(
    session: &Session,
    owner_id: &str,
    document_id: &str,
    query: &str,
    sink: &EventSink,
) -> Result<ToolOutcome, TurnError> {
    sink.send(StreamEvent::SubAgentStart {
        document_id: document_id.to_string(),
        query: query.to_string(),
    })
    .await?;

    let outcome = analyze(session, owner_id, document_id, query, sink).await?;
    let content = match &outcome {
        Ok(text) => text.clone(),
        Err(e) => e.to_payload(),
    };
    sink.send(StreamEvent::SubAgentResult { content }).await?;
    Ok(outcome)
}

async fn analyze(
    session: &Session,
    owner_id: &str,
    document_id: &str,
    query: &str,
    sink: &EventSink,
) -> Result<ToolOutcome, TurnError> {
    let store = session.store.as_ref();
    let Some(doc) = store.get_document(owner_id, document_id).await? else {
        tracing::warn!(owner = owner_id, document_id, "sub-agent denied: no such document for owner");
        return Ok(Err(ToolError::NotFound(
            "Document not found or access denied.".to_string(),
        )));
    };

    let chunks = store.list_chunks(owner_id, &doc.id).await?;
    if chunks.is_empty() {
        return Ok(Err(ToolError::NotFound(
            "No content found for this document.".to_string(),
        )));
    }

    let joined = chunks
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let content = truncate_content(&joined, session.config.agent.sub_agent_max_chars);

    sink.send(StreamEvent::SubAgentThinking {
        content: format!("Reading {} ({} chunks)...", doc.filename, chunks.len()),
    })
    .await?;
    sink.send(StreamEvent::SubAgentThinking {
        content: "Analyzing document content...".to_string(),
    })
    .await?;

    let request = ChatRequest::new(vec![
        ChatMessage::system(format!(
            "You are analyzing the document '{}'. The full document content is provided below. \
             Answer the user's question thoroughly based on the document content. Be detailed \
             and comprehensive in your analysis.",
            doc.filename
        )),
        ChatMessage::user(format!(
            "Document content:\n\n{}\n\n---\n\nQuestion: {}",
            content, query
        )),
    ]);

    match session.chat.complete(&request).await {
        Ok(completion) if completion.content.trim().is_empty() => {
            Ok(Ok("No analysis generated.".to_string()))
        }
        Ok(completion) => Ok(Ok(completion.content)),
        Err(e) => {
            tracing::error!(document_id, error = %e, "sub-agent model call failed");
            Ok(Err(ToolError::Llm(e)))
        }
    }
}

fn truncate_content(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("ééééé", 3), "ééé\n\n[Content truncated...]");
        assert_eq!(truncate_content("exact", 5), "exact");
    }
}
