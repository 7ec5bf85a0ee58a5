//! Document-level context prefixes for chunk embeddings.
//!
//! One short sentence describing the whole document is generated from its
//! opening text and prepended to every chunk before embedding. Stored chunk
//! content stays raw; only the embedded text carries the prefix.

use crate::llm::{ChatMessage, ChatModel, ChatRequest};

const PREVIEW_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "Write a very brief context sentence (15-25 words) describing what \
this document is about. This will be prepended to text chunks for better search. Be factual and \
specific.";

/// Ask the model for a one-sentence description of the document. Any
/// failure or empty answer yields `None`; ingestion continues without it.
pub async fn document_context(model: &dyn ChatModel, filename: &str, text: &str) -> Option<String> {
    let preview: String = text.chars().take(PREVIEW_CHARS).collect();
    let request = ChatRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Filename: {}\n\nContent preview:\n{}",
            filename, preview
        )),
    ])
    .with_max_tokens(50)
    .with_temperature(0.0);

    match model.complete(&request).await {
        Ok(completion) => clean_context(&completion.content),
        Err(e) => {
            tracing::warn!(filename, error = %e, "contextualization failed, embedding plain chunks");
            None
        }
    }
}

fn clean_context(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Text that gets embedded for a chunk.
pub fn with_context(context: Option<&str>, chunk: &str) -> String {
    match context {
        Some(ctx) => format!("[Document context: {}]\n\n{}", ctx, chunk),
        None => chunk.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedChatModel;

    #[tokio::test]
    async fn test_context_trimmed_and_period_dropped() {
        let model = ScriptedChatModel::always("  A travel guide to Paris landmarks.  ");
        let ctx = document_context(&model, "paris.md", "The Eiffel Tower...").await;
        assert_eq!(ctx.as_deref(), Some("A travel guide to Paris landmarks"));

        let req = &model.requests()[0];
        assert_eq!(req.max_tokens, Some(50));
        let user = req.messages[1].content.as_deref().unwrap();
        assert!(user.starts_with("Filename: paris.md\n\nContent preview:\n"));
    }

    #[tokio::test]
    async fn test_preview_capped() {
        let model = ScriptedChatModel::always("ctx");
        let text = "y".repeat(5000);
        document_context(&model, "big.txt", &text).await;
        let user = model.requests()[0].messages[1].content.clone().unwrap();
        assert_eq!(user.matches('y').count(), PREVIEW_CHARS);
    }

    #[tokio::test]
    async fn test_failure_and_blank_yield_none() {
        let model = ScriptedChatModel::unreachable();
        assert_eq!(document_context(&model, "a.txt", "text").await, None);
        let model = ScriptedChatModel::always(" . ");
        assert_eq!(document_context(&model, "a.txt", "text").await, None);
    }

    #[test]
    fn test_prefix_format() {
        assert_eq!(
            with_context(Some("About towers"), "Tall."),
            "[Document context: About towers]\n\nTall."
        );
        assert_eq!(with_context(None, "Tall."), "Tall.");
    }
}
