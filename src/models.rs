//! Core data models used throughout docent.
//!
//! These types represent the documents, chunks, and messages that flow
//! through ingestion, retrieval, and the chat loop. Timestamps are unix
//! seconds, matching the SQLite schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a document through the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// Outcome of the non-fatal metadata extraction stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStatus {
    Pending,
    Completed,
    Failed,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Pending => "pending",
            MetadataStatus::Completed => "completed",
            MetadataStatus::Failed => "failed",
        }
    }
}

impl FromStr for MetadataStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MetadataStatus::Pending),
            "completed" => Ok(MetadataStatus::Completed),
            "failed" => Ok(MetadataStatus::Failed),
            other => anyhow::bail!("unknown metadata status: {}", other),
        }
    }
}

/// Descriptive fields produced by the metadata extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub document_type: String,
    pub language: String,
}

/// An uploaded document owned by a single user.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub content_type: String,
    pub file_size: i64,
    pub storage_path: String,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub chunk_count: i64,
    pub extracted_metadata: Option<ExtractedMetadata>,
    pub metadata_status: MetadataStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored segment of a document, the unit of embedding and retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub owner_id: String,
    pub chunk_index: i64,
    /// Raw chunk text, shown to users and the model.
    pub content: String,
    pub embedding: Vec<f32>,
    /// `{filename, chunk_index, doc_context}`.
    pub metadata: Value,
}

/// A ranked row returned by either search leg.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRow {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: Value,
    pub score: f64,
}

impl SearchRow {
    pub fn filename(&self) -> &str {
        self.metadata
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown message role: {}", other),
        }
    }
}

/// One entry of the tool-call audit log attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
    pub result: String,
}

/// A persisted conversation message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub owner_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub created_at: i64,
}

/// Filter on a document's extracted metadata, with JSON containment
/// semantics: every key in the filter must be contained in the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub serde_json::Map<String, Value>);

impl MetadataFilter {
    /// Build a filter from a tool argument, ignoring non-object values
    /// and null entries.
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        let map = value?.as_object()?;
        let cleaned: serde_json::Map<String, Value> = map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if cleaned.is_empty() {
            None
        } else {
            Some(Self(cleaned))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a document with the given extracted metadata passes.
    pub fn matches(&self, metadata: Option<&ExtractedMetadata>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(metadata) = metadata else {
            return false;
        };
        let Ok(target) = serde_json::to_value(metadata) else {
            return false;
        };
        contains(&target, &Value::Object(self.0.clone()))
    }
}

fn contains(target: &Value, filter: &Value) -> bool {
    match (target, filter) {
        (Value::Object(t), Value::Object(f)) => f
            .iter()
            .all(|(k, fv)| t.get(k).is_some_and(|tv| contains(tv, fv))),
        (Value::Array(t), Value::Array(f)) => {
            f.iter().all(|fv| t.iter().any(|tv| contains(tv, fv)))
        }
        // A scalar filter against an array target means "array contains it".
        (Value::Array(t), scalar) => t.iter().any(|tv| contains(tv, scalar)),
        (Value::String(t), Value::String(f)) => t.eq_ignore_ascii_case(f),
        (t, f) => t == f,
    }
}

/// Current unix time in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Format a unix timestamp as ISO 8601.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
