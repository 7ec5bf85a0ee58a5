//! TOML configuration for docent.
//!
//! Static, deployment-level parameters live here (database path, chunk
//! sizes, retrieval and agent tuning). Admin-editable model settings are
//! seeded from the `[llm]` and `[embedding]` sections into
//! [`GlobalSettings`](crate::settings::GlobalSettings) at startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters carried over from the end of one chunk into the next.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// The `k` constant of reciprocal rank fusion.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Each search leg fetches `fetch × leg_overfetch` candidates.
    #[serde(default = "default_leg_overfetch")]
    pub leg_overfetch: usize,
    /// Fusion keeps `top_k × rerank_overfetch` rows for the reranker.
    #[serde(default = "default_rerank_overfetch")]
    pub rerank_overfetch: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_true")]
    pub hyde_enabled: bool,
    #[serde(default = "default_true")]
    pub rerank_enabled: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            leg_overfetch: default_leg_overfetch(),
            rerank_overfetch: default_rerank_overfetch(),
            default_top_k: default_top_k(),
            hyde_enabled: true,
            rerank_enabled: true,
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_leg_overfetch() -> usize {
    3
}
fn default_rerank_overfetch() -> usize {
    2
}
fn default_top_k() -> usize {
    10
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Tool results are truncated to this many characters in the audit log.
    #[serde(default = "default_audit_result_chars")]
    pub audit_result_chars: usize,
    #[serde(default = "default_sub_agent_max_chars")]
    pub sub_agent_max_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            audit_result_chars: default_audit_result_chars(),
            sub_agent_max_chars: default_sub_agent_max_chars(),
        }
    }
}

fn default_max_tool_rounds() -> usize {
    5
}
fn default_audit_result_chars() -> usize {
    500
}
fn default_sub_agent_max_chars() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqlConfig {
    #[serde(default = "default_sql_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_row_cap")]
    pub row_cap: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sql_timeout_secs(),
            row_cap: default_row_cap(),
        }
    }
}

fn default_sql_timeout_secs() -> u64 {
    5
}
fn default_row_cap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            system_prompt: None,
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the provider (OpenAI-compatible endpoint or Ollama).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }
    if config.retrieval.leg_overfetch == 0 || config.retrieval.rerank_overfetch == 0 {
        anyhow::bail!("retrieval overfetch factors must be >= 1");
    }
    if config.retrieval.default_top_k == 0
        || config.retrieval.default_top_k > crate::retrieval::MAX_TOP_K
    {
        anyhow::bail!(
            "retrieval.default_top_k must be between 1 and {}",
            crate::retrieval::MAX_TOP_K
        );
    }

    if config.agent.max_tool_rounds == 0 {
        anyhow::bail!("agent.max_tool_rounds must be >= 1");
    }
    if config.sql.row_cap == 0 || config.sql.timeout_secs == 0 {
        anyhow::bail!("sql.row_cap and sql.timeout_secs must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be openai or disabled.",
            other
        ),
    }

    Ok(())
}
