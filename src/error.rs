//! Error taxonomy shared across ingestion, retrieval, and the chat loop.
//!
//! Enrichment failures (contextualization, metadata, HyDE, reranking) have
//! no variant here: they are logged and replaced by a degraded path at the
//! call site.

use std::fmt;
use thiserror::Error;

use crate::llm::LlmError;

/// Ingestion stage that can fail a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extraction,
    Chunking,
    Embedding,
    Storage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extraction => "extraction",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Storage => "storage",
        })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed upload. Nothing was written.
    #[error("invalid upload: {0}")]
    Validation(String),
    /// The owner already has a document with identical content.
    #[error("duplicate content: already uploaded as '{existing_filename}'")]
    DuplicateContent {
        existing_id: String,
        existing_filename: String,
    },
    /// A pipeline stage failed; the document has been marked failed.
    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },
    #[error("document not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl IngestError {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        IngestError::Stage {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query must not be empty")]
    EmptyQuery,
    /// Both the vector and the lexical leg failed.
    #[error("search backend unavailable (vector: {vector}; lexical: {lexical})")]
    BackendUnavailable { vector: String, lexical: String },
}

/// A tool invocation that could not produce a normal result. Rendered
/// into the tool message so the model can react; never aborts a turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("query rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Text placed in the tool message and the audit log.
    pub fn to_payload(&self) -> String {
        format!("Error: {}", self)
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("storage failure: {0}")]
    Store(#[from] anyhow::Error),
    /// The event consumer went away.
    #[error("turn cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings can only be changed by an admin")]
    Forbidden,
    #[error("embedding settings are locked while {chunk_count} chunks exist")]
    EmbeddingLocked { chunk_count: i64 },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
