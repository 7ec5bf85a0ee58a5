//! Text-to-SQL with a guard in front of the database.
//!
//! The model sees a schema describing only the caller-visible columns of
//! `documents` and `chunks`. Its proposed query is validated in three
//! steps before anything runs:
//!
//! 1. single `SELECT`/`WITH` statement, at most one trailing `;`;
//! 2. no write, DDL or escape-hatch keyword anywhere (whole-word match),
//!    no schema-qualified or internal table names;
//! 3. executed on a read-only connection, wrapped so that `documents` and
//!    `chunks` resolve to CTEs filtered by the caller's owner id, with a
//!    row cap and a timeout.

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::ToolError;
use crate::llm::{complete_json, ChatMessage, ChatRequest};
use crate::services::Session;

pub const SCHEMA_CONTEXT: &str = "Available tables (SQLite):

TABLE documents (
  id TEXT PRIMARY KEY,
  filename TEXT NOT NULL,
  content_type TEXT NOT NULL,
  file_size INTEGER NOT NULL,
  status TEXT NOT NULL,          -- pending, processing, completed, failed
  error_message TEXT,
  chunk_count INTEGER NOT NULL,
  extracted_metadata TEXT,       -- JSON: {title, summary, keywords[], document_type, language}
  metadata_status TEXT NOT NULL, -- pending, completed, failed
  created_at INTEGER NOT NULL,   -- unix seconds
  updated_at INTEGER NOT NULL    -- unix seconds
);

TABLE chunks (
  id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL REFERENCES documents(id),
  chunk_index INTEGER NOT NULL,
  content TEXT NOT NULL,
  metadata TEXT NOT NULL         -- JSON: {filename, chunk_index, doc_context}
);

NOTES:
- Only the current user's rows are visible; do not filter by user.
- Only generate a single SELECT query.
- Use json_extract(extracted_metadata, '$.key') for metadata fields.
- Use datetime(created_at, 'unixepoch') to format timestamps.";

const SYSTEM_PROMPT: &str = "You are a SQL query generator. Convert natural language questions \
into SQLite SELECT queries over the schema you are given. Return only valid SQL.";

static LEADING_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(select|with)\b").expect("valid regex"));

static FORBIDDEN_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|copy|execute|exec|attach|detach|pragma|replace|vacuum|reindex)\b",
    )
    .expect("valid regex")
});

static INTERNAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(sqlite_\w*|pragma_\w*|chunks_fts\w*|messages|load_extension)\b")
        .expect("valid regex")
});

// Bare or quoted (`"main"`, `[main]`, `` `main` ``, `'main'`) schema prefixes.
static SCHEMA_QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(main|temp|temporary)\b\s*["'`\]]?\s*\."#).expect("valid regex")
});

static SHADOWED_CTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(documents|chunks)\s*(\([^)]*\))?\s+as\s*(not\s+)?(materialized\s+)?\(")
        .expect("valid regex")
});

/// Structured output requested from the model.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlProposal {
    pub sql: String,
    pub explanation: String,
}

fn rejected(msg: impl Into<String>) -> ToolError {
    ToolError::Rejected(msg.into())
}

/// Validate a proposed query. Returns the statement with surrounding
/// whitespace and one trailing `;` removed.
pub fn validate_sql(sql: &str) -> Result<String, ToolError> {
    let trimmed = sql.trim();
    let statement = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    let lowered = statement.to_lowercase();

    if !LEADING_SELECT.is_match(&lowered) {
        return Err(rejected("Only SELECT queries are allowed"));
    }
    if lowered.contains(';') {
        return Err(rejected("Multiple statements are not allowed"));
    }
    if let Some(m) = FORBIDDEN_KEYWORD.find(&lowered) {
        return Err(rejected(format!(
            "Forbidden SQL keyword: {} (keywords are blocked even inside string literals)",
            m.as_str()
        )));
    }
    if let Some(m) = INTERNAL_NAME.find(&lowered) {
        return Err(rejected(format!("Access to '{}' is not allowed", m.as_str())));
    }
    if SCHEMA_QUALIFIED.is_match(&lowered) {
        return Err(rejected("Schema-qualified table names are not allowed"));
    }
    if SHADOWED_CTE.is_match(&lowered) {
        return Err(rejected("Redefining documents or chunks is not allowed"));
    }
    Ok(statement.to_string())
}

/// Wrap a validated statement so it can only see the owner's rows. The
/// owner id is bound as `?1` at execution time.
pub fn scope_to_owner(statement: &str, row_cap: usize) -> String {
    format!(
        "WITH documents AS (\n\
         SELECT id, filename, content_type, file_size, status, error_message, chunk_count, \
         extracted_metadata, metadata_status, created_at, updated_at \
         FROM main.documents WHERE owner_id = ?1\n\
         ), chunks AS (\n\
         SELECT id, document_id, chunk_index, content, metadata \
         FROM main.chunks WHERE owner_id = ?1\n\
         )\n\
         SELECT * FROM (\n{}\n) LIMIT {}",
        statement, row_cap
    )
}

pub fn format_output(explanation: &str, statement: &str, rows: &[Value]) -> String {
    let mut out = format!("**Query:** {}\n\n```sql\n{}\n```\n\n", explanation, statement);
    if rows.is_empty() {
        out.push_str("**Results:** No rows returned.");
    } else {
        let pretty = serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string());
        out.push_str(&format!(
            "**Results ({} rows):**\n```json\n{}\n```",
            rows.len(),
            pretty
        ));
    }
    out
}

fn proposal_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "sql": {"type": "string"},
            "explanation": {"type": "string"}
        },
        "required": ["sql", "explanation"],
        "additionalProperties": false
    })
}

/// Validate and run an already-proposed statement for `owner_id`.
pub async fn execute_guarded(
    session: &Session,
    owner_id: &str,
    proposal: &SqlProposal,
) -> Result<String, ToolError> {
    let statement = validate_sql(&proposal.sql).inspect_err(|e| {
        tracing::warn!(owner = owner_id, sql = %proposal.sql, error = %e, "sql rejected");
    })?;

    let sql_cfg = &session.config.sql;
    let scoped = scope_to_owner(&statement, sql_cfg.row_cap);
    let rows = session
        .store
        .run_readonly_query(owner_id, &scoped, Duration::from_secs(sql_cfg.timeout_secs))
        .await
        .map_err(|e| {
            tracing::warn!(owner = owner_id, error = %e, "sql execution failed");
            ToolError::Execution(format!("SQL query failed: {:#}", e))
        })?;

    tracing::info!(owner = owner_id, rows = rows.len(), "sql tool executed");
    Ok(format_output(&proposal.explanation, &statement, &rows))
}

/// Turn a natural-language question into a guarded query and run it.
pub async fn run_sql_tool(
    session: &Session,
    owner_id: &str,
    question: &str,
) -> Result<String, ToolError> {
    let request = ChatRequest::new(vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Schema:\n{}\n\nQuestion: {}\n\nGenerate a SELECT query to answer this question.",
            SCHEMA_CONTEXT, question
        )),
    ])
    .with_json_schema("sql_query", proposal_schema());

    let proposal: SqlProposal = complete_json(session.chat.as_ref(), &request).await?;
    execute_guarded(session, owner_id, &proposal).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(sql: &str) -> String {
        match validate_sql(sql) {
            Err(ToolError::Rejected(msg)) => msg,
            other => panic!("expected rejection for {:?}, got {:?}", sql, other),
        }
    }

    #[test]
    fn test_accepts_plain_select_and_trailing_semicolon() {
        assert_eq!(
            validate_sql("  SELECT filename FROM documents;  ").unwrap(),
            "SELECT filename FROM documents"
        );
        assert!(validate_sql("WITH d AS (SELECT id FROM documents) SELECT count(*) FROM d").is_ok());
        assert!(validate_sql("select status, count(*) from documents group by status").is_ok());
    }

    #[test]
    fn test_rejects_non_select() {
        assert_eq!(reason("DROP TABLE documents;"), "Only SELECT queries are allowed");
        assert_eq!(reason("PRAGMA table_info(documents)"), "Only SELECT queries are allowed");
        assert_eq!(reason("selectivity"), "Only SELECT queries are allowed");
    }

    #[test]
    fn test_rejects_multiple_statements() {
        assert_eq!(
            reason("SELECT 1; DELETE FROM documents;"),
            "Multiple statements are not allowed"
        );
    }

    #[test]
    fn test_rejects_forbidden_keywords_whole_word() {
        assert_eq!(
            reason("SELECT * FROM documents WHERE id IN (SELECT 1) OR 1=1 UNION SELECT replace(filename,'a','b') FROM documents"),
            "Forbidden SQL keyword: replace (keywords are blocked even inside string literals)"
        );
        assert!(reason("SELECT filename FROM documents WHERE filename LIKE '%update%'")
            .contains("even inside string literals"));
        assert!(reason("with x as (select 1) delete from documents").contains("delete"));
        // Substrings of identifiers are fine.
        assert!(validate_sql("SELECT updated_at, created_at FROM documents").is_ok());
    }

    #[test]
    fn test_rejects_internal_and_qualified_names() {
        assert!(reason("SELECT * FROM sqlite_master").contains("sqlite_master"));
        assert!(reason("SELECT * FROM messages").contains("messages"));
        assert!(reason("SELECT * FROM chunks_fts WHERE chunks_fts MATCH 'x'").contains("chunks_fts"));
        assert!(reason("SELECT * FROM pragma_table_info('documents')").contains("pragma_table_info"));
        assert_eq!(
            reason("SELECT * FROM main . documents"),
            "Schema-qualified table names are not allowed"
        );
        for sql in [
            r#"SELECT filename FROM "main".documents"#,
            "SELECT content FROM [main].chunks",
            "SELECT filename FROM `main`.documents",
            "SELECT filename FROM 'main'.documents",
            r#"SELECT filename FROM "MAIN" . "documents""#,
            "SELECT * FROM [temp].documents",
        ] {
            assert_eq!(reason(sql), "Schema-qualified table names are not allowed", "{}", sql);
        }
        // Column qualifiers and identifiers merely containing the word pass.
        assert!(validate_sql("SELECT d.filename, d.domain FROM documents d").is_ok());
        assert_eq!(
            reason("WITH documents AS (SELECT 1) SELECT * FROM documents"),
            "Redefining documents or chunks is not allowed"
        );
    }

    #[test]
    fn test_scoped_query_shape() {
        let scoped = scope_to_owner("SELECT count(*) AS n FROM documents", 50);
        assert!(scoped.starts_with("WITH documents AS ("));
        assert!(scoped.contains("FROM main.documents WHERE owner_id = ?1"));
        assert!(scoped.contains("FROM main.chunks WHERE owner_id = ?1"));
        assert!(scoped.ends_with("\nSELECT count(*) AS n FROM documents\n) LIMIT 50"));
    }

    #[test]
    fn test_format_output() {
        let rows = vec![json!({"n": 2})];
        let out = format_output("Counts documents", "SELECT count(*) AS n FROM documents", &rows);
        assert!(out.starts_with("**Query:** Counts documents\n\n```sql\nSELECT count(*)"));
        assert!(out.contains("**Results (1 rows):**\n```json\n[\n  {\n    \"n\": 2\n  }\n]\n```"));
        let empty = format_output("x", "SELECT 1", &[]);
        assert!(empty.ends_with("**Results:** No rows returned."));
    }
}
