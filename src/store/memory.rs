//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search counts distinct query
//! terms present in each chunk. There is no SQL engine, so
//! [`Store::run_readonly_query`] always fails.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::embedding::cosine_similarity;
use crate::models::{
    now_ts, Chunk, Document, DocumentStatus, ExtractedMetadata, Message, MetadataFilter,
    MetadataStatus, SearchRow,
};

use super::{query_terms, sort_rows, Store};

pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
    messages: RwLock<Vec<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Completed documents of `owner_id` that pass `filter`.
    fn searchable_docs(
        &self,
        owner_id: &str,
        filter: Option<&MetadataFilter>,
    ) -> HashSet<String> {
        let docs = self.docs.read().unwrap();
        docs.values()
            .filter(|d| d.owner_id == owner_id && d.status == DocumentStatus::Completed)
            .filter(|d| filter.map_or(true, |f| f.matches(d.extracted_metadata.as_ref())))
            .map(|d| d.id.clone())
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_row(chunk: &Chunk, score: f64) -> SearchRow {
    SearchRow {
        chunk_id: chunk.id.clone(),
        document_id: chunk.document_id.clone(),
        content: chunk.content.clone(),
        metadata: chunk.metadata.clone(),
        score,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document, replaces: Option<&str>) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        let conflict = docs.values().any(|d| {
            d.owner_id == doc.owner_id
                && d.content_hash == doc.content_hash
                && Some(d.id.as_str()) != replaces
        });
        if conflict {
            return Ok(false);
        }
        if let Some(old_id) = replaces {
            docs.remove(old_id);
            self.chunks
                .write()
                .unwrap()
                .retain(|c| c.document_id != old_id);
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(true)
    }

    async fn get_document(&self, owner_id: &str, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(id).filter(|d| d.owner_id == owner_id).cloned())
    }

    async fn find_by_fingerprint(
        &self,
        owner_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .values()
            .find(|d| d.owner_id == owner_id && d.content_hash == content_hash)
            .cloned())
    }

    async fn find_by_filename(&self, owner_id: &str, filename: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .values()
            .filter(|d| d.owner_id == owner_id && d.filename == filename)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap();
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete_document(&self, owner_id: &str, id: &str) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        if !docs.get(id).is_some_and(|d| d.owner_id == owner_id) {
            return Ok(false);
        }
        docs.remove(id);
        self.chunks.write().unwrap().retain(|c| c.document_id != id);
        Ok(true)
    }

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        if let Some(doc) = docs.get_mut(id) {
            doc.status = status;
            doc.error_message = error_message.map(str::to_string);
            doc.updated_at = now_ts();
        }
        Ok(())
    }

    async fn complete_document(&self, id: &str, chunk_count: i64) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        if let Some(doc) = docs.get_mut(id) {
            doc.status = DocumentStatus::Completed;
            doc.error_message = None;
            doc.chunk_count = chunk_count;
            doc.updated_at = now_ts();
        }
        Ok(())
    }

    async fn set_metadata(
        &self,
        id: &str,
        metadata: Option<&ExtractedMetadata>,
        status: MetadataStatus,
    ) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        if let Some(doc) = docs.get_mut(id) {
            doc.extracted_metadata = metadata.cloned();
            doc.metadata_status = status;
            doc.updated_at = now_ts();
        }
        Ok(())
    }

    async fn count_completed_documents(&self, owner_id: &str) -> Result<i64> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .values()
            .filter(|d| d.owner_id == owner_id && d.status == DocumentStatus::Completed)
            .count() as i64)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        stored.retain(|c| c.document_id != document_id);
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> Result<Vec<Chunk>> {
        let stored = self.chunks.read().unwrap();
        let mut out: Vec<Chunk> = stored
            .iter()
            .filter(|c| c.document_id == document_id && c.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.chunk_index);
        Ok(out)
    }

    async fn count_chunks(&self) -> Result<i64> {
        Ok(self.chunks.read().unwrap().len() as i64)
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        query_vec: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>> {
        let allowed = self.searchable_docs(owner_id, filter);
        let stored = self.chunks.read().unwrap();
        let mut rows: Vec<SearchRow> = stored
            .iter()
            .filter(|c| allowed.contains(&c.document_id) && !c.embedding.is_empty())
            .map(|c| to_row(c, cosine_similarity(query_vec, &c.embedding) as f64))
            .collect();
        sort_rows(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>> {
        let terms: HashSet<String> = query_terms(query).into_iter().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let allowed = self.searchable_docs(owner_id, filter);
        let stored = self.chunks.read().unwrap();
        let mut rows: Vec<SearchRow> = stored
            .iter()
            .filter(|c| allowed.contains(&c.document_id))
            .filter_map(|c| {
                let words: HashSet<String> = query_terms(&c.content).into_iter().collect();
                let matches = terms.iter().filter(|t| words.contains(*t)).count();
                (matches > 0).then(|| to_row(c, matches as f64))
            })
            .collect();
        sort_rows(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn run_readonly_query(
        &self,
        _owner_id: &str,
        _sql: &str,
        _timeout: Duration,
    ) -> Result<Vec<Value>> {
        bail!("SQL queries are not supported by the in-memory store")
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.messages.write().unwrap().push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, owner_id: &str, thread_id: &str) -> Result<Vec<Message>> {
        let stored = self.messages.read().unwrap();
        Ok(stored
            .iter()
            .filter(|m| m.owner_id == owner_id && m.thread_id == thread_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, owner: &str, hash: &str) -> Document {
        Document {
            id: id.into(),
            owner_id: owner.into(),
            filename: format!("{}.txt", id),
            content_type: "text/plain".into(),
            file_size: 10,
            storage_path: format!("{}/{}", owner, id),
            content_hash: hash.into(),
            status: DocumentStatus::Completed,
            error_message: None,
            chunk_count: 0,
            extracted_metadata: None,
            metadata_status: MetadataStatus::Pending,
            created_at: 1,
            updated_at: 1,
        }
    }

    fn chunk(id: &str, doc: &str, owner: &str, text: &str, v: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc.into(),
            owner_id: owner.into(),
            chunk_index: 0,
            content: text.into(),
            embedding: v,
            metadata: json!({"filename": format!("{}.txt", doc)}),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_conflict_is_per_owner() {
        let store = InMemoryStore::new();
        assert!(store.insert_document(&doc("a", "u1", "h"), None).await.unwrap());
        assert!(!store.insert_document(&doc("b", "u1", "h"), None).await.unwrap());
        assert!(store.insert_document(&doc("c", "u2", "h"), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_removes_old_doc_and_chunks() {
        let store = InMemoryStore::new();
        store.insert_document(&doc("a", "u1", "h1"), None).await.unwrap();
        store
            .replace_chunks("a", &[chunk("c1", "a", "u1", "old", vec![1.0])])
            .await
            .unwrap();
        store
            .insert_document(&doc("b", "u1", "h2"), Some("a"))
            .await
            .unwrap();
        assert!(store.get_document("u1", "a").await.unwrap().is_none());
        assert_eq!(store.count_chunks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_searches_are_owner_scoped() {
        let store = InMemoryStore::new();
        store.insert_document(&doc("a", "u1", "h1"), None).await.unwrap();
        store.insert_document(&doc("b", "u2", "h2"), None).await.unwrap();
        store
            .replace_chunks("a", &[chunk("c1", "a", "u1", "paris tower", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_chunks("b", &[chunk("c2", "b", "u2", "paris tower", vec![1.0, 0.0])])
            .await
            .unwrap();

        let kw = store.keyword_search("u1", "tower", 10, None).await.unwrap();
        assert_eq!(kw.len(), 1);
        assert_eq!(kw[0].chunk_id, "c1");

        let vs = store
            .vector_search("u1", &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn test_pending_documents_not_searchable() {
        let store = InMemoryStore::new();
        let mut d = doc("a", "u1", "h1");
        d.status = DocumentStatus::Processing;
        store.insert_document(&d, None).await.unwrap();
        store
            .replace_chunks("a", &[chunk("c1", "a", "u1", "tower", vec![1.0])])
            .await
            .unwrap();
        assert!(store
            .keyword_search("u1", "tower", 10, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let store = InMemoryStore::new();
        store.insert_document(&doc("a", "u1", "h1"), None).await.unwrap();
        assert!(!store.delete_document("u2", "a").await.unwrap());
        assert!(store.delete_document("u1", "a").await.unwrap());
    }
}
