//! # Docent
//!
//! Upload documents, search them, and chat with a model that can read them.
//!
//! Docent ingests files (text, Markdown, CSV, HTML, JSON, PDF, DOCX, PPTX,
//! XLSX) into per-owner chunk indexes, retrieves with a hybrid of vector
//! and lexical search fused by reciprocal rank, and answers questions in a
//! bounded tool-calling loop whose progress is streamed as server-sent
//! events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────┐
//! │  Upload  │──▶│ Extract → Chunk →     │──▶│  SQLite   │
//! │ HTTP/CLI │   │ Contextualize → Embed │   │ FTS5+Vec  │
//! └──────────┘   └──────────────────────┘   └─────┬─────┘
//!                                                 │
//!             ┌──────────────────┬────────────────┤
//!             ▼                  ▼                ▼
//!       ┌───────────┐     ┌────────────┐    ┌───────────┐
//!       │  Search   │◀────│ Chat turn  │───▶│ SQL guard │
//!       │ HyDE+RRF  │     │ tool loop  │    │ read-only │
//!       └───────────┘     └─────┬──────┘    └───────────┘
//!                               ▼
//!                         ┌───────────┐
//!                         │ Sub-agent │
//!                         └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docent init
//! docent upload ./reports
//! docent search "quarterly revenue"
//! docent ask "Summarize my latest report"
//! docent serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction per content type |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | Upload and processing pipeline |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat model abstraction |
//! | [`retrieval`] | Hybrid search, reranking, evaluation |
//! | [`agent`] | Chat turn, tools, SQL guard, sub-agent |
//! | [`store`] | Storage trait and backends |
//! | [`server`] | HTTP API |
//! | [`settings`] | Runtime-changeable provider settings |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod objects;
pub mod retrieval;
pub mod server;
pub mod services;
pub mod settings;
pub mod store;
