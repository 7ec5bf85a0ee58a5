//! SQLite-backed [`Store`] implementation.
//!
//! Documents, chunks and messages live in plain tables; the lexical leg
//! uses the `chunks_fts` FTS5 table ranked by `bm25`, and the vector leg
//! scans the owner's chunk embeddings (stored as little-endian f32 BLOBs)
//! and ranks them by cosine similarity in process. Metadata filters are
//! applied in Rust against the parsed `extracted_metadata` column.
//!
//! The SQL tool runs on a second, read-only pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    now_ts, Chunk, Document, DocumentStatus, ExtractedMetadata, Message, MetadataFilter,
    MetadataStatus, Role, SearchRow, ToolCallRecord,
};

use super::{query_terms, sort_rows, Store};

const DOCUMENT_COLUMNS: &str = "id, owner_id, filename, content_type, file_size, storage_path, \
     content_hash, status, error_message, chunk_count, extracted_metadata, metadata_status, \
     created_at, updated_at";

pub struct SqliteStore {
    pool: SqlitePool,
    readonly: Option<SqlitePool>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            readonly: None,
        }
    }

    pub fn with_readonly(pool: SqlitePool, readonly: SqlitePool) -> Self {
        Self {
            pool,
            readonly: Some(readonly),
        }
    }

    /// Open both pools for the configured database. The schema must
    /// already exist (`docent init`).
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let readonly = db::connect_readonly(&config.db.path).await?;
        Ok(Self::with_readonly(pool, readonly))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let metadata_status: String = row.get("metadata_status");
    let extracted: Option<String> = row.get("extracted_metadata");
    let extracted_metadata = match extracted {
        Some(raw) => Some(serde_json::from_str::<ExtractedMetadata>(&raw)?),
        None => None,
    };
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        file_size: row.get("file_size"),
        storage_path: row.get("storage_path"),
        content_hash: row.get("content_hash"),
        status: status.parse()?,
        error_message: row.get("error_message"),
        chunk_count: row.get("chunk_count"),
        extracted_metadata,
        metadata_status: metadata_status.parse()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let metadata: String = row.get("metadata");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        owner_id: row.get("owner_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        embedding: embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata)?,
    })
}

/// Whether a row's document passes `filter`, given the raw
/// `extracted_metadata` column.
fn passes_filter(filter: Option<&MetadataFilter>, raw_metadata: Option<&str>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let parsed = raw_metadata.and_then(|raw| serde_json::from_str::<ExtractedMetadata>(raw).ok());
    filter.matches(parsed.as_ref())
}

/// Build an FTS5 query that ORs the quoted query terms, so user input can
/// never be parsed as FTS syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Convert a dynamically typed result row to a JSON object, keyed by
/// column name.
fn row_to_json(row: &SqliteRow) -> Result<Value> {
    let mut obj = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => json!(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => json!(row.try_get_unchecked::<f64, _>(i)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(i)?;
                    json!(format!("<{} bytes>", bytes.len()))
                }
                _ => json!(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        obj.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(obj))
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document, replaces: Option<&str>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let conflict: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM documents WHERE owner_id = ? AND content_hash = ? AND id != COALESCE(?, '')",
        )
        .bind(&doc.owner_id)
        .bind(&doc.content_hash)
        .bind(replaces)
        .fetch_one(&mut *tx)
        .await?;
        if conflict {
            return Ok(false);
        }

        if let Some(old_id) = replaces {
            sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM documents WHERE id = ? AND owner_id = ?")
                .bind(old_id)
                .bind(&doc.owner_id)
                .execute(&mut *tx)
                .await?;
        }

        let metadata_json = doc
            .extracted_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, filename, content_type, file_size, storage_path,
                                   content_hash, status, error_message, chunk_count,
                                   extracted_metadata, metadata_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, content_hash) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(doc.file_size)
        .bind(&doc.storage_path)
        .bind(&doc.content_hash)
        .bind(doc.status.as_str())
        .bind(&doc.error_message)
        .bind(doc.chunk_count)
        .bind(metadata_json)
        .bind(doc.metadata_status.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost a race with a concurrent upload of the same content.
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_document(&self, owner_id: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ? AND owner_id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_fingerprint(
        &self,
        owner_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? AND content_hash = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_filename(&self, owner_id: &str, filename: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? AND filename = ? ORDER BY created_at DESC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? ORDER BY created_at DESC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_document(&self, owner_id: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM documents WHERE id = ? AND owner_id = ?",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            return Ok(false);
        }
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_document(&self, id: &str, chunk_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'completed', error_message = NULL, chunk_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_metadata(
        &self,
        id: &str,
        metadata: Option<&ExtractedMetadata>,
        status: MetadataStatus,
    ) -> Result<()> {
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE documents SET extracted_metadata = ?, metadata_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(metadata_json)
        .bind(status.as_str())
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_completed_documents(&self, owner_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE owner_id = ? AND status = 'completed'",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = (!chunk.embedding.is_empty()).then(|| vec_to_blob(&chunk.embedding));
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, owner_id, chunk_index, content, embedding, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.owner_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(blob)
            .bind(chunk.metadata.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, owner_id, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.owner_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, owner_id: &str, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, owner_id, chunk_index, content, embedding, metadata
            FROM chunks
            WHERE document_id = ? AND owner_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn count_chunks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        query_vec: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.content, c.metadata, c.embedding,
                   d.extracted_metadata
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.owner_id = ? AND d.status = 'completed' AND c.embedding IS NOT NULL
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in &rows {
            let doc_metadata: Option<String> = row.get("extracted_metadata");
            if !passes_filter(filter, doc_metadata.as_deref()) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let metadata: String = row.get("metadata");
            results.push(SearchRow {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                content: row.get("content"),
                metadata: serde_json::from_str(&metadata)?,
                score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
            });
        }

        sort_rows(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn keyword_search(
        &self,
        owner_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchRow>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        // With a filter, rows are dropped after the query, so fetch them all.
        let sql_limit: i64 = match filter {
            Some(_) => -1,
            None => i64::try_from(limit).unwrap_or(-1),
        };

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id, c.document_id, c.content, c.metadata,
                   bm25(chunks_fts) AS bm25_score, d.extracted_metadata
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE chunks_fts MATCH ? AND chunks_fts.owner_id = ? AND d.status = 'completed'
            ORDER BY bm25_score
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(owner_id)
        .bind(sql_limit)
        .fetch_all(&self.pool)
        .await
        .context("full-text query failed")?;

        let mut results = Vec::new();
        for row in &rows {
            let doc_metadata: Option<String> = row.get("extracted_metadata");
            if !passes_filter(filter, doc_metadata.as_deref()) {
                continue;
            }
            let rank: f64 = row.get("bm25_score");
            let metadata: String = row.get("metadata");
            results.push(SearchRow {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                content: row.get("content"),
                metadata: serde_json::from_str(&metadata)?,
                // bm25 is lower-is-better; flip so higher means stronger.
                score: -rank,
            });
        }

        sort_rows(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn run_readonly_query(
        &self,
        owner_id: &str,
        sql: &str,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let pool = self
            .readonly
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no read-only connection configured"))?;

        let rows = tokio::time::timeout(
            timeout,
            sqlx::query(sql).bind(owner_id).fetch_all(pool),
        )
        .await
        .map_err(|_| anyhow::anyhow!("query timed out after {}s", timeout.as_secs()))??;

        rows.iter().map(row_to_json).collect()
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let tool_calls = message
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, owner_id, role, content, tool_calls, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.thread_id)
        .bind(&message.owner_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(tool_calls)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, owner_id: &str, thread_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, thread_id, owner_id, role, content, tool_calls, created_at
            FROM messages
            WHERE owner_id = ? AND thread_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(owner_id)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row.get("role");
            let tool_calls: Option<String> = row.get("tool_calls");
            let tool_calls = match tool_calls {
                Some(raw) => Some(serde_json::from_str::<Vec<ToolCallRecord>>(&raw)?),
                None => None,
            };
            out.push(Message {
                id: row.get("id"),
                thread_id: row.get("thread_id"),
                owner_id: row.get("owner_id"),
                role: role.parse::<Role>()?,
                content: row.get("content"),
                tool_calls,
                created_at: row.get("created_at"),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query("eiffel AND tower*").unwrap(),
            "\"eiffel\" OR \"and\" OR \"tower\""
        );
        assert!(fts_query("?!").is_none());
    }

    #[test]
    fn test_filter_requires_parsable_metadata() {
        let filter = MetadataFilter::from_value(Some(&json!({"language": "English"}))).unwrap();
        assert!(!passes_filter(Some(&filter), None));
        assert!(!passes_filter(Some(&filter), Some("not json")));
        assert!(passes_filter(None, None));
    }
}
