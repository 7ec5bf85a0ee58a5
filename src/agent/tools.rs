//! Tool descriptors offered to the model, and parsing of its calls.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::llm::{ToolCall, ToolSpec};
use crate::models::MetadataFilter;

pub const SEARCH_DOCUMENTS: &str = "search_documents";
pub const QUERY_DOCUMENTS_SQL: &str = "query_documents_sql";
pub const ANALYZE_DOCUMENT: &str = "analyze_document";

/// What the resolver knows about the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserState {
    pub completed_documents: i64,
}

/// Tools for one turn. A user without completed documents gets none, so
/// the model answers from the conversation alone.
pub fn resolve_tools(state: &UserState) -> Vec<ToolSpec> {
    if state.completed_documents <= 0 {
        return Vec::new();
    }
    vec![search_documents_spec(), query_sql_spec(), analyze_document_spec()]
}

fn search_documents_spec() -> ToolSpec {
    ToolSpec {
        name: SEARCH_DOCUMENTS.to_string(),
        description: "Search the user's uploaded documents for relevant information. Use this \
            tool whenever the user asks any question about their documents, personal \
            information, work history, or any topic that could be in their uploaded files. You \
            can optionally filter by metadata like document_type or language."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to find relevant document content"
                },
                "filters": {
                    "type": "object",
                    "description": "Optional metadata filters. Keys can include: document_type (e.g. report, article, notes), language (e.g. English), keywords (array of terms)",
                    "properties": {
                        "document_type": {"type": "string"},
                        "language": {"type": "string"},
                        "keywords": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "required": ["query"]
        }),
    }
}

fn query_sql_spec() -> ToolSpec {
    ToolSpec {
        name: QUERY_DOCUMENTS_SQL.to_string(),
        description: "Run analytical queries against the user's documents and chunks using \
            natural language converted to SQL. Use for counting, listing, comparing, or \
            aggregating document metadata. Examples: 'how many documents?', 'list all PDFs', \
            'total chunks across documents'."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The natural language question to convert to SQL"
                }
            },
            "required": ["question"]
        }),
    }
}

fn analyze_document_spec() -> ToolSpec {
    ToolSpec {
        name: ANALYZE_DOCUMENT.to_string(),
        description: "Delegate deep analysis of a specific document to a sub-agent that reads \
            the full document content. Use when the user asks to summarize, analyze, review, or \
            deeply examine a particular document. The sub-agent loads all chunks and provides a \
            thorough analysis."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "document_id": {
                    "type": "string",
                    "description": "The id of the document to analyze"
                },
                "query": {
                    "type": "string",
                    "description": "What to analyze or what question to answer about the document"
                }
            },
            "required": ["document_id", "query"]
        }),
    }
}

/// A parsed, typed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Search {
        query: String,
        filter: Option<MetadataFilter>,
    },
    Sql {
        question: String,
    },
    Analyze {
        document_id: String,
        query: String,
    },
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    filters: Option<Value>,
}

#[derive(Deserialize)]
struct SqlArgs {
    question: String,
}

#[derive(Deserialize)]
struct AnalyzeArgs {
    document_id: String,
    query: String,
}

fn args<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    let raw = if call.arguments.trim().is_empty() {
        "{}"
    } else {
        call.arguments.as_str()
    };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn non_empty(field: &str, value: String) -> Result<String, ToolError> {
    if value.trim().is_empty() {
        Err(ToolError::InvalidArguments(format!("{} must not be empty", field)))
    } else {
        Ok(value)
    }
}

pub fn parse_invocation(call: &ToolCall) -> Result<ToolInvocation, ToolError> {
    match call.name.as_str() {
        SEARCH_DOCUMENTS => {
            let a: SearchArgs = args(call)?;
            Ok(ToolInvocation::Search {
                query: non_empty("query", a.query)?,
                filter: MetadataFilter::from_value(a.filters.as_ref()),
            })
        }
        QUERY_DOCUMENTS_SQL => {
            let a: SqlArgs = args(call)?;
            Ok(ToolInvocation::Sql {
                question: non_empty("question", a.question)?,
            })
        }
        ANALYZE_DOCUMENT => {
            let a: AnalyzeArgs = args(call)?;
            Ok(ToolInvocation::Analyze {
                document_id: non_empty("document_id", a.document_id)?,
                query: non_empty("query", a.query)?,
            })
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}
