//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use docent::config::Config;
use docent::embedding::mock::HashEmbedder;
use docent::ingest::{self, UploadRequest};
use docent::llm::mock::ScriptedChatModel;
use docent::llm::{ChatCompletion, ChatModel};
use docent::models::Document;
use docent::objects::MemoryObjectStore;
use docent::services::{FixedProviders, Services, Session};
use docent::store::sqlite::SqliteStore;
use docent::store::memory::InMemoryStore;
use docent::store::Store;
use tempfile::TempDir;

pub const EMBED_DIMS: usize = 64;

/// Config with HyDE and reranking off, so tests control every model call.
pub fn test_config(extra: &str) -> Config {
    let raw = format!(
        "[db]\npath = \"unused.sqlite\"\n\n[retrieval]\nhyde_enabled = false\nrerank_enabled = false\n\n{}",
        extra
    );
    toml::from_str(&raw).expect("test config")
}

pub fn services(config: Config, store: Arc<dyn Store>, chat: Arc<dyn ChatModel>) -> Services {
    Services::new(
        config,
        store,
        Arc::new(MemoryObjectStore::new()),
        Arc::new(FixedProviders::new(
            chat,
            Arc::new(HashEmbedder::new(EMBED_DIMS)),
        )),
    )
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(InMemoryStore::new())
}

/// A SQLite store in a temp dir, with schema applied and a read-only pool.
pub async fn sqlite_store(dir: &TempDir) -> Arc<SqliteStore> {
    let path = dir.path().join("docent.sqlite");
    let pool = docent::db::connect_path(&path).await.expect("pool");
    docent::migrate::apply_schema(&pool).await.expect("schema");
    let readonly = docent::db::connect_readonly(Path::new(&path))
        .await
        .expect("readonly pool");
    Arc::new(SqliteStore::with_readonly(pool, readonly))
}

/// Model used during ingestion: a short document context, and a valid
/// metadata object for structured requests.
pub fn ingest_model() -> Arc<ScriptedChatModel> {
    Arc::new(ScriptedChatModel::with_handler(|req| {
        if req.response_format.is_some() {
            Ok(ChatCompletion::text(
                r#"{"title":"Doc","summary":"A document.","keywords":["doc"],"document_type":"notes","language":"English"}"#,
            ))
        } else {
            Ok(ChatCompletion::text("A test document."))
        }
    }))
}

pub async fn ingest(session: &Session, owner: &str, filename: &str, body: &str) -> Document {
    let doc = ingest::upload(
        session,
        UploadRequest {
            owner_id: owner.to_string(),
            filename: filename.to_string(),
            content_type: None,
            bytes: body.as_bytes().to_vec(),
        },
    )
    .await
    .expect("upload");
    ingest::process_document(session, owner, &doc.id)
        .await
        .expect("process")
}
