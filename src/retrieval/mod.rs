//! Hybrid retrieval: HyDE-expanded vector search plus lexical search,
//! fused with reciprocal rank fusion and optionally reranked by the LLM.
//!
//! ```text
//! query ─┬─ hyde → embed → vector_search ─┐
//!        └─────────────── keyword_search ─┴─ rrf(fetch) → rerank(top_k)
//! ```
//!
//! `fetch = top_k × rerank_overfetch`; each leg retrieves
//! `fetch × leg_overfetch` candidates. A failed leg is dropped and the
//! surviving one ranks alone; only when both fail is the search an error.

pub mod eval;
pub mod fusion;
pub mod hyde;
pub mod rerank;

use crate::embedding::embed_query;
use crate::error::SearchError;
use crate::models::{MetadataFilter, SearchRow};
use crate::services::Session;

/// Largest `top_k` accepted from callers.
pub const MAX_TOP_K: usize = 50;

/// Check a caller-supplied result count against `1..=MAX_TOP_K`.
pub fn check_top_k(top_k: usize) -> Result<usize, String> {
    if (1..=MAX_TOP_K).contains(&top_k) {
        Ok(top_k)
    } else {
        Err(format!("top_k must be between 1 and {}, got {}", MAX_TOP_K, top_k))
    }
}

pub async fn search(
    session: &Session,
    owner_id: &str,
    query: &str,
    top_k: usize,
    filter: Option<&MetadataFilter>,
) -> Result<Vec<SearchRow>, SearchError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(SearchError::EmptyQuery);
    }
    let cfg = &session.config.retrieval;
    let top_k = top_k.max(1);
    let fetch = top_k.saturating_mul(cfg.rerank_overfetch);
    let leg_limit = fetch.saturating_mul(cfg.leg_overfetch);

    let vector = vector_leg(session, owner_id, query, leg_limit, filter);
    let lexical = session
        .store
        .keyword_search(owner_id, query, leg_limit, filter);

    let (vector, lexical) = futures::join!(vector, lexical);
    let lists = match (vector, lexical) {
        (Ok(v), Ok(l)) => vec![v, l],
        (Ok(v), Err(e)) => {
            tracing::warn!(error = %e, "lexical search failed, using vector results only");
            vec![v]
        }
        (Err(e), Ok(l)) => {
            tracing::warn!(error = %e, "vector search failed, using lexical results only");
            vec![l]
        }
        (Err(ve), Err(le)) => {
            return Err(SearchError::BackendUnavailable {
                vector: format!("{:#}", ve),
                lexical: format!("{:#}", le),
            })
        }
    };

    let fused = fusion::reciprocal_rank_fusion(&lists, cfg.rrf_k, fetch);
    let results = if cfg.rerank_enabled {
        rerank::rerank(session.chat.as_ref(), query, fused, top_k).await
    } else {
        let mut fused = fused;
        fused.truncate(top_k);
        fused
    };

    tracing::debug!(owner = owner_id, query, results = results.len(), "hybrid search");
    Ok(results)
}

async fn vector_leg(
    session: &Session,
    owner_id: &str,
    query: &str,
    limit: usize,
    filter: Option<&MetadataFilter>,
) -> anyhow::Result<Vec<SearchRow>> {
    let text = if session.config.retrieval.hyde_enabled {
        hyde::transform_query(session.chat.as_ref(), query).await
    } else {
        query.to_string()
    };
    let vector = embed_query(session.embedder.as_ref(), &text).await?;
    session
        .store
        .vector_search(owner_id, &vector, limit, filter)
        .await
}

/// Render results for a tool message.
pub fn format_results(rows: &[SearchRow]) -> String {
    if rows.is_empty() {
        return "No relevant documents found.".to_string();
    }
    rows.iter()
        .map(|r| {
            format!(
                "[Source: {}] (document_id: {}, score: {:.4})\n{}",
                r.filename(),
                r.document_id,
                r.score,
                r.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
