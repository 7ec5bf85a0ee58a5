//! Storage abstraction for docent.
//!
//! The [`Store`] trait covers everything the core needs from a database:
//! document and chunk persistence, the two search legs used by hybrid
//! retrieval, message history, and the read-only executor behind the SQL
//! tool. Every data-access method that reads user data takes the owner id.
//!
//! Implementations:
//! - [`sqlite::SqliteStore`]: sqlx + FTS5 + f32 BLOB vectors.
//! - [`memory::InMemoryStore`]: `HashMap`/`Vec` behind `RwLock`, for tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::models::{
    Chunk, Document, DocumentStatus, ExtractedMetadata, Message, MetadataFilter, MetadataStatus,
    SearchRow,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](Store::insert_document) | Insert a pending document, optionally replacing another |
/// | [`replace_chunks`](Store::replace_chunks) | Delete-then-insert a document's chunks |
/// | [`vector_search`](Store::vector_search) | Cosine ranking over chunk embeddings |
/// | [`keyword_search`](Store::keyword_search) | Lexical ranking over chunk text |
/// | [`run_readonly_query`](Store::run_readonly_query) | Execute a guarded SELECT |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `doc`. When `replaces` is set, that document and its chunks
    /// are deleted in the same transaction.
    ///
    /// Returns `false` (and writes nothing) if the owner already has a
    /// document with the same content hash.
    async fn insert_document(&self, doc: &Document, replaces: Option<&str>) -> Result<bool>;

    async fn get_document(&self, owner_id: &str, id: &str) -> Result<Option<Document>>;

    async fn find_by_fingerprint(&self, owner_id: &str, content_hash: &str)
        -> Result<Option<Document>>;

    async fn find_by_filename(&self, owner_id: &str, filename: &str) -> Result<Option<Document>>;

    /// Newest first.
    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>>;

    /// Delete a document and its chunks. Returns `false` if the owner has
    /// no such document.
    async fn delete_document(&self, owner_id: &str, id: &str) -> Result<bool>;

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Mark completed with the final chunk count and clear any error.
    async fn complete_document(&self, id: &str, chunk_count: i64) -> Result<()>;

    async fn set_metadata(
        &self,
        id: &str,
        metadata: Option<&ExtractedMetadata>,
        status: MetadataStatus,
    ) -> Result<()>;

    async fn count_completed_documents(&self, owner_id: &str) -> Result<i64>;

    /// Replace all chunks of a document. Re-running with the same input
    /// leaves exactly one copy.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document in ordinal order.
    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> Result<Vec<Chunk>>;

    /// Total chunks across all owners.
    async fn count_chunks(&self) -> Result<i64>;

    /// Top `limit` chunks of completed documents by cosine similarity.
    async fn vector_search(
        &self,
        owner_id: &str,
        query_vec: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>>;

    /// Top `limit` chunks of completed documents by lexical match strength.
    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>>;

    /// Execute a query already validated and scoped by the SQL guard.
    /// `?1` in `sql` is bound to `owner_id`. Rows come back as JSON objects.
    async fn run_readonly_query(
        &self,
        owner_id: &str,
        sql: &str,
        timeout: Duration,
    ) -> Result<Vec<Value>>;

    async fn insert_message(&self, message: &Message) -> Result<()>;

    /// Oldest first.
    async fn list_messages(&self, owner_id: &str, thread_id: &str) -> Result<Vec<Message>>;
}

/// Query terms for lexical search: lower-cased alphanumeric words.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Sort descending by score; ties by chunk id so rankings are stable.
pub(crate) fn sort_rows(rows: &mut [SearchRow]) {
    rows.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_terms_strip_punctuation() {
        assert_eq!(
            query_terms("How tall is the Eiffel-Tower?"),
            vec!["how", "tall", "is", "the", "eiffel", "tower"]
        );
    }

    #[test]
    fn test_sort_rows_breaks_ties_by_id() {
        let row = |id: &str, score: f64| SearchRow {
            chunk_id: id.to_string(),
            document_id: "d".to_string(),
            content: String::new(),
            metadata: Value::Null,
            score,
        };
        let mut rows = vec![row("b", 1.0), row("a", 1.0), row("c", 2.0)];
        sort_rows(&mut rows);
        let ids: Vec<&str> = rows.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
