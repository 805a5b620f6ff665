pub mod blob;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod query;
pub mod reranking;
pub mod store;
pub mod types;

// Re-export primary types for convenience
pub use config::{bench_config, AppConfig, BenchConfig, Environment, PromptStyle};
pub use engine::RagEngine;
pub use error::IngestError;
pub use query::ChatSession;
pub use types::{
    BulkIngestSummary, ChunkRow, ContextItem, DocumentRecord, IngestReport, QueryResponse,
};

// Re-export common types
pub use anyhow::{Error, Result};
pub use uuid::Uuid;
