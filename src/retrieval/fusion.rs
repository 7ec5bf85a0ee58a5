//! Reciprocal rank fusion.

use std::collections::HashMap;

use crate::models::SearchRow;

/// Merge ranked lists with RRF: each candidate scores
/// `Σ 1 / (k + rank)` over the lists it appears in (ranks are 1-based).
/// Output is sorted by fused score, ties by chunk id ascending, and cut to
/// `limit`. The returned rows carry the fused score.
pub fn reciprocal_rank_fusion(lists: &[Vec<SearchRow>], k: f64, limit: usize) -> Vec<SearchRow> {
    let mut fused: HashMap<&str, (f64, &SearchRow)> = HashMap::new();
    for list in lists {
        for (i, row) in list.iter().enumerate() {
            let contribution = 1.0 / (k + (i + 1) as f64);
            fused
                .entry(row.chunk_id.as_str())
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, row));
        }
    }

    let mut rows: Vec<SearchRow> = fused
        .into_values()
        .map(|(score, row)| SearchRow {
            score,
            ..row.clone()
        })
        .collect();
    crate::store::sort_rows(&mut rows);
    rows.truncate(limit);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn rows(ids: &[&str]) -> Vec<SearchRow> {
        ids.iter()
            .map(|id| SearchRow {
                chunk_id: id.to_string(),
                document_id: "doc".to_string(),
                content: format!("content {}", id),
                metadata: Value::Null,
                score: 0.0,
            })
            .collect()
    }

    fn ids(rows: &[SearchRow]) -> Vec<&str> {
        rows.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_fused_order_and_scores() {
        let vector = rows(&["A", "B", "C"]);
        let lexical = rows(&["B", "D", "A"]);
        let fused = reciprocal_rank_fusion(&[vector, lexical], 60.0, 10);
        assert_eq!(ids(&fused), vec!["B", "A", "D", "C"]);

        let expect_b = 1.0 / 62.0 + 1.0 / 61.0;
        let expect_a = 1.0 / 61.0 + 1.0 / 63.0;
        assert!((fused[0].score - expect_b).abs() < 1e-12);
        assert!((fused[1].score - expect_a).abs() < 1e-12);
        assert!((fused[2].score - 1.0 / 62.0).abs() < 1e-12);
        assert!((fused[3].score - 1.0 / 63.0).abs() < 1e-12);
    }

    #[test]
    fn test_ties_broken_by_chunk_id() {
        let fused = reciprocal_rank_fusion(&[rows(&["Z"]), rows(&["M"])], 60.0, 10);
        assert_eq!(ids(&fused), vec!["M", "Z"]);
    }

    #[test]
    fn test_single_list_keeps_order_and_limit() {
        let fused = reciprocal_rank_fusion(&[rows(&["c", "a", "b"])], 60.0, 2);
        assert_eq!(ids(&fused), vec!["c", "a"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(reciprocal_rank_fusion(&[], 60.0, 5).is_empty());
        assert!(reciprocal_rank_fusion(&[Vec::new(), Vec::new()], 60.0, 5).is_empty());
    }
}
