//! Top-level engine: wires the document store, hybrid index, blob store,
//! models and generator from one config, then exposes ingestion and
//! querying. Services are built once at startup and shared immutably.

use anyhow::{Context, Result};
use std::sync::Arc;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::{bench_config, AppConfig, Environment};
use crate::embedding::{Embedder, HostedEmbedder, LocalEmbedder};
use crate::index::VectorIndex;
use crate::ingest::parser::{PdfParser, PlainTextParser};
use crate::ingest::IngestPipeline;
use crate::llm::{Generator, OpenAiGenerator};
use crate::query::{ChatSession, QueryPipeline};
use crate::reranking::{CrossEncoderReranker, HostedReranker, Reranker};
use crate::store::DocumentStore;
use crate::types::{BulkIngestSummary, DocumentRecord, QueryResponse};

/// Subdirectory of the embedding model dir holding the local encoder.
const LOCAL_EMBEDDER_DIR: &str = "bge-m3";
/// Subdirectory holding the local cross-encoder.
const LOCAL_RERANKER_DIR: &str = "mxbai-rerank-xsmall-v1";

pub struct RagEngine {
    config: AppConfig,
    store: Arc<DocumentStore>,
    ingest: IngestPipeline,
    query: QueryPipeline,
}

impl RagEngine {
    /// Build the engine with the plain-text fallback parser. Deployments
    /// with a layout engine use [`RagEngine::with_parser`].
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_parser(config, Arc::new(PlainTextParser)).await
    }

    pub async fn with_parser(config: AppConfig, parser: Arc<dyn PdfParser>) -> Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;

        let store = Arc::new(
            DocumentStore::connect(&config.database)
                .await
                .context("document store unavailable")?,
        );
        store.init_schema().await?;

        let (embedder, reranker) = build_models(&config)?;

        let index = Arc::new(
            VectorIndex::open(
                &config.data_dir.join("index"),
                config.environment.collection_name(),
                embedder.dimension(),
            )
            .await
            .context("vector index unavailable")?,
        );

        let blobs = Arc::new(
            BlobStore::connect(&config.blob)
                .await
                .context("blob store unavailable")?,
        );

        let generator: Arc<dyn Generator> = Arc::new(OpenAiGenerator::new(&config.generator)?);

        let ingest = IngestPipeline::new(
            store.clone(),
            index.clone(),
            blobs,
            embedder.clone(),
            generator.clone(),
            parser,
            config.chunking.clone(),
        );

        let query = QueryPipeline::new(
            store.clone(),
            index,
            embedder,
            reranker,
            generator,
            config.search.clone(),
            config.generator.clone(),
            config.rerank.min_score,
        );

        tracing::info!(environment = ?config.environment, "RAG engine ready");
        Ok(Self {
            config,
            store,
            ingest,
            query,
        })
    }

    /// Ingest a batch of PDFs under the chunking knobs of the given
    /// benchmark config id.
    pub async fn ingest_bulk(
        &self,
        files: Vec<(String, Vec<u8>)>,
        config_id: &str,
    ) -> BulkIngestSummary {
        let config = bench_config(config_id);
        self.ingest.ingest_bulk(files, config.chunk_mode).await
    }

    /// Answer a question, using the retrieval knobs of the given benchmark
    /// config id and the caller's session memory.
    pub async fn query(
        &self,
        question: &str,
        session: &mut ChatSession,
        doc_filter: Option<Uuid>,
        config_id: &str,
    ) -> Result<QueryResponse> {
        let config = bench_config(config_id);
        self.query
            .query(question, session, doc_filter, config_id, &config)
            .await
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        self.store.list_documents().await
    }

    /// Fresh dialog memory for one conversation.
    pub fn new_session(&self) -> ChatSession {
        ChatSession::new(self.config.generator.history_limit)
    }
}

/// Environment selects local ONNX models or hosted endpoints for the
/// embedding and reranking capabilities.
fn build_models(config: &AppConfig) -> Result<(Arc<dyn Embedder>, Arc<dyn Reranker>)> {
    match config.environment {
        Environment::Development => {
            let embedder = LocalEmbedder::load(
                &config.embedding.model_dir.join(LOCAL_EMBEDDER_DIR),
                config.embedding.dimension,
            )
            .context("local embedder unavailable")?;
            let reranker =
                CrossEncoderReranker::load(&config.rerank.model_dir.join(LOCAL_RERANKER_DIR))
                    .context("local reranker unavailable")?;
            Ok((Arc::new(embedder), Arc::new(reranker)))
        }
        Environment::Production => {
            let embedder = HostedEmbedder::new(&config.embedding)?;
            let reranker = HostedReranker::new(&config.rerank)?;
            Ok((Arc::new(embedder), Arc::new(reranker)))
        }
    }
}
