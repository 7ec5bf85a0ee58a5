//! Retrieval quality evaluation.
//!
//! Runs the full search pipeline for a set of questions with known answer
//! keywords and reports recall@5, recall@10 and mean reciprocal rank.
//! Cases can be written by hand or generated from the owner's own chunks
//! with [`generate_cases`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::{complete_json, ChatMessage, ChatRequest};
use crate::models::DocumentStatus;
use crate::services::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    pub question: String,
    pub expected_keywords: Vec<String>,
    /// Only results whose filename contains this (case-insensitive) count.
    #[serde(default)]
    pub expected_document: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalCaseResult {
    pub question: String,
    pub hit: bool,
    /// 1-based rank of the first relevant result.
    pub rank: Option<usize>,
    pub top_previews: Vec<String>,
    pub expected_keywords: Vec<String>,
    pub matched_keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub total_cases: usize,
    pub hits: usize,
    pub recall_at_5: f64,
    pub recall_at_10: f64,
    pub mrr: f64,
    pub results: Vec<EvalCaseResult>,
}

fn matched_keywords(content: &str, keywords: &[String]) -> Vec<String> {
    let lower = content.to_lowercase();
    keywords
        .iter()
        .filter(|kw| lower.contains(&kw.to_lowercase()))
        .cloned()
        .collect()
}

/// Evaluate every case against the owner's index. A failed search counts
/// as a miss and is reported on the case.
pub async fn run_eval(
    session: &Session,
    owner_id: &str,
    cases: &[EvalCase],
    top_k: usize,
) -> EvalSummary {
    let mut results = Vec::with_capacity(cases.len());
    let mut hits_at_5 = 0usize;
    let mut hits_at_10 = 0usize;
    let mut reciprocal_sum = 0.0;

    for case in cases {
        let rows = match super::search(session, owner_id, &case.question, top_k, None).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(question = %case.question, error = %e, "eval search failed");
                results.push(EvalCaseResult {
                    question: case.question.clone(),
                    hit: false,
                    rank: None,
                    top_previews: Vec::new(),
                    expected_keywords: case.expected_keywords.clone(),
                    matched_keywords: Vec::new(),
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let expected_doc = case.expected_document.as_ref().map(|d| d.to_lowercase());
        let mut rank = None;
        let mut matched: Vec<String> = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if let Some(doc) = &expected_doc {
                if !row.filename().to_lowercase().contains(doc.as_str()) {
                    continue;
                }
            }
            let found = matched_keywords(&row.content, &case.expected_keywords);
            if !found.is_empty() && rank.is_none() {
                rank = Some(i + 1);
            }
            for kw in found {
                if !matched.contains(&kw) {
                    matched.push(kw);
                }
            }
        }

        if let Some(r) = rank {
            reciprocal_sum += 1.0 / r as f64;
            if r <= 5 {
                hits_at_5 += 1;
            }
            if r <= 10 {
                hits_at_10 += 1;
            }
        }

        results.push(EvalCaseResult {
            question: case.question.clone(),
            hit: rank.is_some(),
            rank,
            top_previews: rows
                .iter()
                .take(3)
                .map(|r| r.content.chars().take(100).collect())
                .collect(),
            expected_keywords: case.expected_keywords.clone(),
            matched_keywords: matched,
            error: None,
        });
    }

    let total = cases.len();
    let ratio = |n: f64| if total == 0 { 0.0 } else { n / total as f64 };
    EvalSummary {
        total_cases: total,
        hits: results.iter().filter(|r| r.hit).count(),
        recall_at_5: ratio(hits_at_5 as f64),
        recall_at_10: ratio(hits_at_10 as f64),
        mrr: ratio(reciprocal_sum),
        results,
    }
}

#[derive(Deserialize)]
struct GeneratedCase {
    question: String,
    keywords: Vec<String>,
}

/// Build up to `max_cases` cases from the owner's completed documents,
/// taking every other chunk and asking the model for a question it
/// answers. Chunks the model fails on are skipped.
pub async fn generate_cases(
    session: &Session,
    owner_id: &str,
    max_cases: usize,
) -> anyhow::Result<Vec<EvalCase>> {
    let mut pool = Vec::new();
    for doc in session.store.list_documents(owner_id).await? {
        if doc.status != DocumentStatus::Completed {
            continue;
        }
        for chunk in session.store.list_chunks(owner_id, &doc.id).await? {
            pool.push((doc.filename.clone(), chunk.content));
            if pool.len() >= max_cases * 2 {
                break;
            }
        }
        if pool.len() >= max_cases * 2 {
            break;
        }
    }

    let schema = json!({
        "type": "object",
        "properties": {
            "question": {"type": "string"},
            "keywords": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["question", "keywords"],
        "additionalProperties": false
    });

    let mut cases = Vec::new();
    for (filename, content) in pool.into_iter().step_by(2).take(max_cases) {
        let passage: String = content.chars().take(500).collect();
        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "Given a text passage, generate:\n\
                 1. A natural question that this passage answers\n\
                 2. 2-3 key terms from the passage that should appear in search results\n\n\
                 Return JSON: {\"question\": \"...\", \"keywords\": [\"...\"]}",
            ),
            ChatMessage::user(format!("Passage from '{}':\n\n{}", filename, passage)),
        ])
        .with_json_schema("eval_case", schema.clone())
        .with_max_tokens(150);

        match complete_json::<GeneratedCase>(session.chat.as_ref(), &request).await {
            Ok(generated) => cases.push(EvalCase {
                question: generated.question,
                expected_keywords: generated.keywords,
                expected_document: Some(filename),
            }),
            Err(e) => tracing::warn!(filename = %filename, error = %e, "failed to generate eval case"),
        }
    }
    tracing::info!(owner = owner_id, cases = cases.len(), "generated eval cases");
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_match_case_insensitive() {
        let kws = vec!["Eiffel".to_string(), "louvre".to_string()];
        assert_eq!(
            matched_keywords("the EIFFEL tower", &kws),
            vec!["Eiffel".to_string()]
        );
    }

    #[test]
    fn test_case_deserializes_without_document() {
        let case: EvalCase =
            serde_json::from_str(r#"{"question":"q","expected_keywords":["a"]}"#).unwrap();
        assert_eq!(case.expected_document, None);
    }
}
