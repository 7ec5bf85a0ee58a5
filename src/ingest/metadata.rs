//! Structured metadata extraction for completed documents.

use serde_json::{json, Value};

use crate::llm::{complete_json, ChatMessage, ChatModel, ChatRequest, LlmError};
use crate::models::ExtractedMetadata;

const MAX_CHUNKS: usize = 5;
const MAX_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You are a document metadata extractor. Analyze the provided document \
content and extract structured metadata. Be concise and accurate.";

pub fn metadata_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "summary": {"type": "string"},
            "keywords": {"type": "array", "items": {"type": "string"}},
            "document_type": {"type": "string"},
            "language": {"type": "string"}
        },
        "required": ["title", "summary", "keywords", "document_type", "language"],
        "additionalProperties": false
    })
}

/// Extract metadata from the first chunks of a document (in ordinal
/// order). A malformed response is an error, never a partial record.
pub async fn extract_metadata(
    model: &dyn ChatModel,
    chunks: &[String],
) -> Result<ExtractedMetadata, LlmError> {
    if chunks.is_empty() {
        return Err(LlmError::InvalidResponse(
            "no chunks to extract metadata from".to_string(),
        ));
    }
    let joined = chunks
        .iter()
        .take(MAX_CHUNKS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n\n");
    let content: String = joined.chars().take(MAX_CHARS).collect();

    let request = ChatRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Extract metadata from this document:\n\n{}\n\n\
             Return a JSON object with: title, summary (1-2 sentences), keywords (3-7 relevant \
             terms), document_type (e.g. report, article, notes, manual, spreadsheet, \
             presentation, email, resume, contract, other), language (e.g. English, Spanish, etc.)",
            content
        )),
    ])
    .with_json_schema("document_metadata", metadata_schema());

    complete_json(model, &request).await
}
