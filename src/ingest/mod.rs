//! Ingestion pipeline.
//!
//! Upload flow: validate → fingerprint → dedup gate → raw-file write →
//! pending row. The returned document is then processed by
//! [`process_document`], normally on its own task via [`spawn_processing`]:
//!
//! ```text
//! pending → processing → extract → chunk → contextualize → embed → store → completed
//!                            └──────── any failure ───────────────┘→ failed
//! ```
//!
//! Metadata extraction runs after completion and never changes the
//! document status. Contextualization and metadata extraction are
//! best-effort; every other stage failure marks the document failed.

pub mod contextualize;
pub mod metadata;

use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::embedding::embed_batched;
use crate::error::{IngestError, Stage};
use crate::extract::{self, extract_text};
use crate::fingerprint::fingerprint;
use crate::models::{now_ts, Chunk, Document, DocumentStatus, MetadataStatus};
use crate::objects::object_path;
use crate::services::{Services, Session};

/// A raw upload as received from the HTTP layer or the CLI.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: String,
    pub filename: String,
    /// Inferred from the filename extension when absent.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Apply the dedup gate and record a pending document.
///
/// Nothing is written when the upload is invalid or a duplicate. When the
/// owner already has a document with the same filename but different
/// content, that document and its chunks are replaced atomically.
pub async fn upload(session: &Session, req: UploadRequest) -> Result<Document, IngestError> {
    let filename = req.filename.trim().to_string();
    if filename.is_empty() {
        return Err(IngestError::Validation("filename must not be empty".into()));
    }
    if req.bytes.is_empty() {
        return Err(IngestError::Validation("file is empty".into()));
    }
    let max = session.config.chunking.max_upload_bytes;
    if req.bytes.len() > max {
        return Err(IngestError::Validation(format!(
            "file is {} bytes, limit is {}",
            req.bytes.len(),
            max
        )));
    }
    let content_type = match req.content_type.as_deref().map(str::trim) {
        Some(ct) if !ct.is_empty() => ct
            .split(';')
            .next()
            .unwrap_or(ct)
            .trim()
            .to_ascii_lowercase(),
        _ => extract::content_type_for(&filename)
            .ok_or_else(|| {
                IngestError::Validation(format!("cannot infer content type for '{}'", filename))
            })?
            .to_string(),
    };
    if !extract::is_supported(&content_type) {
        return Err(IngestError::Validation(format!(
            "unsupported content type: {}",
            content_type
        )));
    }

    let store = session.store.as_ref();
    let content_hash = fingerprint(&req.bytes);

    if let Some(existing) = store.find_by_fingerprint(&req.owner_id, &content_hash).await? {
        return Err(IngestError::DuplicateContent {
            existing_id: existing.id,
            existing_filename: existing.filename,
        });
    }
    let replaced = store.find_by_filename(&req.owner_id, &filename).await?;

    let id = Uuid::new_v4().to_string();
    let storage_path = object_path(&req.owner_id, &id, &filename);
    session.objects.put(&storage_path, &req.bytes).await?;

    let now = now_ts();
    let doc = Document {
        id,
        owner_id: req.owner_id.clone(),
        filename,
        content_type,
        file_size: req.bytes.len() as i64,
        storage_path,
        content_hash,
        status: DocumentStatus::Pending,
        error_message: None,
        chunk_count: 0,
        extracted_metadata: None,
        metadata_status: MetadataStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    let inserted = store
        .insert_document(&doc, replaced.as_ref().map(|d| d.id.as_str()))
        .await?;
    if !inserted {
        // Lost a race with an identical upload.
        discard_object(session, &doc.storage_path).await;
        let existing = store
            .find_by_fingerprint(&req.owner_id, &doc.content_hash)
            .await?;
        return Err(match existing {
            Some(existing) => IngestError::DuplicateContent {
                existing_id: existing.id,
                existing_filename: existing.filename,
            },
            None => IngestError::Backend(anyhow::anyhow!(
                "document insert was rejected without a conflicting row"
            )),
        });
    }

    if let Some(old) = &replaced {
        discard_object(session, &old.storage_path).await;
        tracing::info!(
            owner = %doc.owner_id,
            filename = %doc.filename,
            old_id = %old.id,
            new_id = %doc.id,
            "replaced document with new content"
        );
    } else {
        tracing::info!(owner = %doc.owner_id, id = %doc.id, filename = %doc.filename, "document accepted");
    }
    Ok(doc)
}

async fn discard_object(session: &Session, path: &str) {
    if let Err(e) = session.objects.delete(path).await {
        tracing::warn!(path, error = %e, "failed to delete raw file");
    }
}

/// Run the pipeline for one document on a background task.
pub fn spawn_processing(services: Services, owner_id: String, document_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session = match services.session() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(id = %document_id, error = %e, "cannot start ingestion");
                let message = format!("{:#}", e);
                if let Err(e) = services
                    .store
                    .update_status(&document_id, DocumentStatus::Failed, Some(&message))
                    .await
                {
                    tracing::error!(id = %document_id, error = %e, "failed to record failure");
                }
                return;
            }
        };
        // Errors are already recorded on the document.
        let _ = process_document(&session, &owner_id, &document_id).await;
    })
}

/// Drive one document from `pending` to `completed` or `failed`.
///
/// Re-running on a completed document is a no-op that returns it as is.
/// On a stage failure the document is marked failed and the error is
/// returned.
pub async fn process_document(
    session: &Session,
    owner_id: &str,
    document_id: &str,
) -> Result<Document, IngestError> {
    let store = session.store.as_ref();
    let doc = store
        .get_document(owner_id, document_id)
        .await?
        .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;
    if doc.status == DocumentStatus::Completed {
        tracing::debug!(id = %doc.id, "document already completed, skipping");
        return Ok(doc);
    }

    store
        .update_status(&doc.id, DocumentStatus::Processing, None)
        .await?;
    let started = std::time::Instant::now();

    let chunks = match run_stages(session, &doc).await {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::error!(id = %doc.id, filename = %doc.filename, error = %err, "ingestion failed");
            store
                .update_status(&doc.id, DocumentStatus::Failed, Some(&err.to_string()))
                .await?;
            return Err(err);
        }
    };

    tracing::info!(
        id = %doc.id,
        filename = %doc.filename,
        chunks = chunks.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "document ingested"
    );

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    match metadata::extract_metadata(session.chat.as_ref(), &texts).await {
        Ok(meta) => {
            store
                .set_metadata(&doc.id, Some(&meta), MetadataStatus::Completed)
                .await?;
        }
        Err(e) => {
            tracing::warn!(id = %doc.id, error = %e, "metadata extraction failed");
            store
                .set_metadata(&doc.id, None, MetadataStatus::Failed)
                .await?;
        }
    }

    store
        .get_document(owner_id, document_id)
        .await?
        .ok_or_else(|| IngestError::NotFound(document_id.to_string()))
}

/// Stages that can fail the document. Returns the stored chunks.
async fn run_stages(session: &Session, doc: &Document) -> Result<Vec<Chunk>, IngestError> {
    let bytes = session
        .objects
        .get(&doc.storage_path)
        .await
        .map_err(|e| IngestError::stage(Stage::Extraction, format!("{:#}", e)))?;

    let text = extract_in_background(bytes, doc.content_type.clone()).await?;
    if text.trim().is_empty() {
        return Err(IngestError::stage(
            Stage::Extraction,
            "no text could be extracted",
        ));
    }

    let chunking = &session.config.chunking;
    let pieces = chunk_text(&text, chunking.chunk_size, chunking.chunk_overlap);
    if pieces.is_empty() {
        return Err(IngestError::stage(Stage::Chunking, "document produced no chunks"));
    }

    let doc_context =
        contextualize::document_context(session.chat.as_ref(), &doc.filename, &text).await;
    let inputs: Vec<String> = pieces
        .iter()
        .map(|p| contextualize::with_context(doc_context.as_deref(), p))
        .collect();

    let vectors = embed_batched(
        session.embedder.as_ref(),
        &inputs,
        session.config.embedding.batch_size,
    )
    .await
    .map_err(|e| IngestError::stage(Stage::Embedding, format!("{:#}", e)))?;

    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (content, embedding))| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            owner_id: doc.owner_id.clone(),
            chunk_index: i as i64,
            content,
            embedding,
            metadata: json!({
                "filename": doc.filename,
                "chunk_index": i,
                "doc_context": doc_context,
            }),
        })
        .collect();

    session
        .store
        .replace_chunks(&doc.id, &chunks)
        .await
        .map_err(|e| IngestError::stage(Stage::Storage, format!("{:#}", e)))?;
    session
        .store
        .complete_document(&doc.id, chunks.len() as i64)
        .await
        .map_err(|e| IngestError::stage(Stage::Storage, format!("{:#}", e)))?;

    Ok(chunks)
}

async fn extract_in_background(bytes: Vec<u8>, content_type: String) -> Result<String, IngestError> {
    let to_stage = |e: extract::ExtractError| IngestError::stage(Stage::Extraction, e.to_string());
    if !extract::is_cpu_heavy(&content_type) {
        return extract_text(&bytes, &content_type).map_err(to_stage);
    }
    tokio::task::spawn_blocking(move || extract_text(&bytes, &content_type))
        .await
        .map_err(|e| IngestError::stage(Stage::Extraction, e.to_string()))?
        .map_err(to_stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::mock::HashEmbedder;
    use crate::llm::mock::ScriptedChatModel;
    use crate::objects::MemoryObjectStore;
    use crate::services::FixedProviders;
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;

    fn session_with(chat: ScriptedChatModel) -> (Session, Arc<MemoryObjectStore>) {
        let config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        let services = Services::new(
            config,
            Arc::new(InMemoryStore::new()),
            objects.clone(),
            Arc::new(FixedProviders::new(
                Arc::new(chat),
                Arc::new(HashEmbedder::new(64)),
            )),
        );
        (services.session().unwrap(), objects)
    }

    fn req(filename: &str, body: &str) -> UploadRequest {
        UploadRequest {
            owner_id: "alice".to_string(),
            filename: filename.to_string(),
            content_type: None,
            bytes: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_without_writes() {
        let (session, objects) = session_with(ScriptedChatModel::always("ctx"));
        let err = upload(&session, req("notes.txt", "")).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        let err = upload(&session, req("   ", "body")).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        let err = upload(&session, req("binary.exe", "body")).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_detected_across_line_endings() {
        let (session, objects) = session_with(ScriptedChatModel::always("ctx"));
        upload(&session, req("a.txt", "line one\nline two\n")).await.unwrap();
        let err = upload(&session, req("b.txt", "line one\r\nline two  \r\n"))
            .await
            .unwrap_err();
        match err {
            IngestError::DuplicateContent {
                existing_filename, ..
            } => assert_eq!(existing_filename, "a.txt"),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn test_process_completes_and_stores_raw_chunks() {
        let (session, _) = session_with(ScriptedChatModel::with_handler(|req| {
            if req.response_format.is_some() {
                Ok(crate::llm::ChatCompletion::text(
                    r#"{"title":"T","summary":"S","keywords":["k"],"document_type":"notes","language":"English"}"#,
                ))
            } else {
                Ok(crate::llm::ChatCompletion::text("Notes about towers."))
            }
        }));
        let doc = upload(&session, req("towers.md", "The Eiffel Tower is 330 metres tall."))
            .await
            .unwrap();
        let done = process_document(&session, "alice", &doc.id).await.unwrap();
        assert_eq!(done.status, DocumentStatus::Completed);
        assert_eq!(done.chunk_count, 1);
        assert_eq!(done.metadata_status, MetadataStatus::Completed);

        let chunks = session.store.list_chunks("alice", &doc.id).await.unwrap();
        assert_eq!(chunks[0].content, "The Eiffel Tower is 330 metres tall.");
        assert_eq!(chunks[0].metadata["doc_context"], "Notes about towers");
    }

    #[tokio::test]
    async fn test_metadata_failure_keeps_document_completed() {
        let (session, _) = session_with(ScriptedChatModel::unreachable());
        let doc = upload(&session, req("a.txt", "Some content here.")).await.unwrap();
        let done = process_document(&session, "alice", &doc.id).await.unwrap();
        assert_eq!(done.status, DocumentStatus::Completed);
        assert_eq!(done.metadata_status, MetadataStatus::Failed);
        let chunks = session.store.list_chunks("alice", &doc.id).await.unwrap();
        assert_eq!(chunks[0].metadata["doc_context"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_document_not_found() {
        let (session, _) = session_with(ScriptedChatModel::always("ctx"));
        let err = process_document(&session, "alice", "missing").await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
