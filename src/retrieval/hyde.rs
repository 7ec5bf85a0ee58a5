//! Hypothetical document embeddings.
//!
//! Questions and document passages live in different regions of embedding
//! space. Embedding a model-written passage that *would* answer the
//! question lands closer to the real answer than the question itself.

use crate::llm::{ChatMessage, ChatModel, ChatRequest};

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Given a question, write a short \
paragraph (3-5 sentences) that would be found in a document answering this question. Write it as \
factual document content, NOT as a response to a question. Do not start with 'Based on' or \
'According to'. Just write the passage.";

/// Text to embed for `query`. Falls back to the query itself when the
/// model fails or returns nothing.
pub async fn transform_query(model: &dyn ChatModel, query: &str) -> String {
    let request = ChatRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(query),
    ])
    .with_max_tokens(200)
    .with_temperature(0.0);

    match model.complete(&request).await {
        Ok(completion) if !completion.content.trim().is_empty() => {
            tracing::debug!(query, passage_chars = completion.content.len(), "hyde transform");
            completion.content.trim().to_string()
        }
        Ok(_) => query.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "hyde transform failed, embedding raw query");
            query.to_string()
        }
    }
}
