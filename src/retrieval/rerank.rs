//! LLM relevance reranking of fused candidates.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::llm::{complete_json, ChatMessage, ChatModel, ChatRequest, LlmError};
use crate::models::SearchRow;

const PASSAGE_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a relevance scoring system. Rate how relevant each passage \
is to the query on a scale of 0-10. Return only a JSON array of objects with 'index' and 'score' \
keys.";

#[derive(Debug, Deserialize)]
struct RelevanceScores {
    scores: Vec<RelevanceScore>,
}

#[derive(Debug, Deserialize)]
struct RelevanceScore {
    index: i64,
    score: f64,
}

fn scores_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": {"type": "integer"},
                        "score": {"type": "number"}
                    },
                    "required": ["index", "score"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["scores"],
        "additionalProperties": false
    })
}

/// Reorder `candidates` by model-assigned relevance and keep `top_k`.
///
/// Scored candidates come first (score descending, fused order on ties),
/// then unscored ones in fused order. With `top_k` or fewer candidates the
/// model is not called. Any model failure keeps the fused order.
pub async fn rerank(
    model: &dyn ChatModel,
    query: &str,
    mut candidates: Vec<SearchRow>,
    top_k: usize,
) -> Vec<SearchRow> {
    if candidates.len() <= top_k {
        return candidates;
    }
    match score_candidates(model, query, &candidates).await {
        Ok(scores) => {
            let mut order: Vec<usize> = (0..candidates.len()).collect();
            // Stable: equal scores and unscored rows keep fused order.
            order.sort_by(|a, b| match (scores.get(a), scores.get(b)) {
                (Some(sa), Some(sb)) => sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
            let mut slots: Vec<Option<SearchRow>> = candidates.into_iter().map(Some).collect();
            order
                .into_iter()
                .take(top_k)
                .filter_map(|i| slots[i].take())
                .collect()
        }
        Err(e) => {
            tracing::warn!(error = %e, "rerank failed, keeping fused order");
            candidates.truncate(top_k);
            candidates
        }
    }
}

async fn score_candidates(
    model: &dyn ChatModel,
    query: &str,
    candidates: &[SearchRow],
) -> Result<HashMap<usize, f64>, LlmError> {
    let passages = candidates
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let preview: String = row.content.chars().take(PASSAGE_CHARS).collect();
            format!("[{}] {}", i, preview)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let request = ChatRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Query: {}\n\nPassages:\n{}\n\nRate each passage's relevance (0-10). \
             Return JSON array: [{{\"index\": 0, \"score\": 8}}, ...]",
            query, passages
        )),
    ])
    .with_json_schema("relevance_scores", scores_schema());

    let parsed: RelevanceScores = complete_json(model, &request).await?;
    let mut scores = HashMap::new();
    for s in parsed.scores {
        if s.index >= 0 && (s.index as usize) < candidates.len() && s.score.is_finite() {
            scores.entry(s.index as usize).or_insert(s.score);
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedChatModel;

    fn rows(n: usize) -> Vec<SearchRow> {
        (0..n)
            .map(|i| SearchRow {
                chunk_id: format!("c{}", i),
                document_id: "d".to_string(),
                content: format!("passage {}", i),
                metadata: Value::Null,
                score: 0.0,
            })
            .collect()
    }

    fn ids(rows: &[SearchRow]) -> Vec<&str> {
        rows.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scored_first_then_unscored_in_fused_order() {
        let model = ScriptedChatModel::always(
            r#"{"scores":[{"index":3,"score":9},{"index":1,"score":5},{"index":2,"score":5},{"index":17,"score":10}]}"#,
        );
        let out = rerank(&model, "q", rows(5), 4).await;
        assert_eq!(ids(&out), vec!["c3", "c1", "c2", "c0"]);
    }

    #[tokio::test]
    async fn test_not_called_when_few_candidates() {
        let model = ScriptedChatModel::unreachable();
        let out = rerank(&model, "q", rows(3), 3).await;
        assert_eq!(out.len(), 3);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_keeps_fused_order() {
        let model = ScriptedChatModel::always("definitely not json");
        let out = rerank(&model, "q", rows(6), 3).await;
        assert_eq!(ids(&out), vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_passages_truncated() {
        let model = ScriptedChatModel::always(r#"{"scores":[]}"#);
        let mut candidates = rows(2);
        candidates[0].content = "z".repeat(900);
        rerank(&model, "q", candidates, 1).await;
        let prompt = model.requests()[0].messages[1].content.clone().unwrap();
        assert_eq!(prompt.matches('z').count(), PASSAGE_CHARS);
        assert!(prompt.contains("[1] passage 1"));
    }
}
