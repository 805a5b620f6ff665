//! Ingestion pipeline: parse, chunk, identify, enrich, persist, vectorize,
//! index. Each document moves through the stages in order; a stage failure
//! is terminal for that document only, and rows committed by earlier
//! stages stay in place.

pub mod ai_enrich;
pub mod chunker;
pub mod enrich;
pub mod identity;
pub mod parser;

use std::sync::Arc;
use std::time::Instant;

use crate::blob::BlobStore;
use crate::config::{ChunkMode, ChunkingConfig};
use crate::embedding::{build_embedding_text, Embedder};
use crate::error::IngestError;
use crate::index::{build_search_text, IndexPoint, VectorIndex};
use crate::llm::Generator;
use crate::store::DocumentStore;
use crate::types::{BulkIngestSummary, IngestReport, IngestStatus};

use ai_enrich::ChunkEnricher;
use chunker::{split_enriched_chunks, LayoutChunker};
use parser::{detect_scanned, ParseOptions, PdfParser};

pub struct IngestPipeline {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    blobs: Arc<BlobStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    parser: Arc<dyn PdfParser>,
    enricher: ChunkEnricher,
    chunking: ChunkingConfig,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        blobs: Arc<BlobStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        parser: Arc<dyn PdfParser>,
        chunking: ChunkingConfig,
    ) -> Self {
        let enricher = ChunkEnricher::new(generator.clone());
        Self {
            store,
            index,
            blobs,
            embedder,
            generator,
            parser,
            enricher,
            chunking,
        }
    }

    /// Ingest files sequentially to bound peak memory. One document's
    /// failure never blocks the next.
    pub async fn ingest_bulk(
        &self,
        files: Vec<(String, Vec<u8>)>,
        chunk_mode: ChunkMode,
    ) -> BulkIngestSummary {
        let total = files.len();
        let mut reports = Vec::with_capacity(total);

        for (filename, pdf) in files {
            let report = match self.ingest_document(&pdf, &filename, chunk_mode).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(
                        filename = %filename,
                        stage = e.stage(),
                        error = %e,
                        "Document ingestion failed"
                    );
                    IngestReport {
                        status: IngestStatus::Failed,
                        doc_id: None,
                        filename,
                        chunks_count: 0,
                        duration_secs: 0.0,
                        error: Some(e.to_string()),
                    }
                }
            };
            // Parsed artifacts for the previous document are dropped before
            // the next file starts.
            reports.push(report);
        }

        let succeeded = reports
            .iter()
            .filter(|r| r.status == IngestStatus::Success)
            .count();
        BulkIngestSummary {
            total,
            succeeded,
            failed: total - succeeded,
            reports,
        }
    }

    pub async fn ingest_document(
        &self,
        pdf: &[u8],
        filename: &str,
        chunk_mode: ChunkMode,
    ) -> Result<IngestReport, IngestError> {
        let started = Instant::now();

        if pdf.is_empty() {
            return Err(IngestError::Input(format!("{filename}: empty file")));
        }

        let doc_id = self
            .store
            .upsert_document(filename)
            .await
            .map_err(|e| IngestError::Persistence(e.to_string()))?;
        tracing::info!(doc_id = %doc_id, filename = %filename, "Ingest started");

        // Parse. Scan detection decides OCR; table structure and page
        // images are always requested.
        let scanned = detect_scanned(pdf);
        let options = ParseOptions::for_document(scanned);
        let parsed = self
            .parser
            .parse(pdf, &options)
            .map_err(|e| IngestError::Parse(format!("{filename}: {e}")))?;
        if parsed.items.is_empty() {
            return Err(IngestError::Parse(format!(
                "{filename}: parser produced no content"
            )));
        }
        tracing::info!(
            doc_id = %doc_id,
            pages = parsed.page_count,
            items = parsed.items.len(),
            scanned,
            "Document parsed"
        );

        // Chunk along the heading tree.
        let (token_budget, overlap) = match chunk_mode {
            ChunkMode::LayoutAuto => (self.chunking.token_budget, self.chunking.overlap),
            ChunkMode::Recursive {
                chunk_size,
                overlap,
            } => (chunk_size, overlap),
        };
        let chunker = LayoutChunker::new(token_budget, self.chunking.merge_under_chars);
        let provisional = chunker.chunk(&parsed);
        if provisional.is_empty() {
            return Err(IngestError::Chunking(format!(
                "{filename}: no chunks produced"
            )));
        }
        tracing::info!(doc_id = %doc_id, chunks = provisional.len(), "Document chunked");

        // Identity card (falls back to a deterministic template).
        let card = identity::create_identity_card(&self.generator, &parsed, filename)
            .await
            .map_err(|e| IngestError::Enrichment(e.to_string()))?;
        self.store
            .insert_identity_chunk(doc_id, &card.text, &card.pages_sampled)
            .await
            .map_err(|e| IngestError::Persistence(e.to_string()))?;

        // Structural enrichment (tables, pages, headings, image uploads)
        // then rechunking of over-long chunks.
        let enriched =
            enrich::enrich_chunks(&parsed, &provisional, &card.text, &self.blobs).await;
        let chunks = split_enriched_chunks(enriched, token_budget, overlap);
        drop(parsed);

        // Persist chunk text; ids come back in input order.
        let chunk_ids = self
            .store
            .insert_chunk_batch(doc_id, &chunks)
            .await
            .map_err(|e| IngestError::Persistence(e.to_string()))?;

        // AI enrichment: visual summaries + entities, bounded concurrency.
        let updates = self.enricher.enrich_all(&chunks, &chunk_ids).await;
        self.store
            .update_chunks_ai(&updates)
            .await
            .map_err(|e| IngestError::Persistence(e.to_string()))?;

        let mut linked = 0usize;
        for update in &updates {
            for entity in &update.entities {
                self.store
                    .link_entity_to_chunk(update.chunk_id, entity)
                    .await
                    .map_err(|e| IngestError::Persistence(e.to_string()))?;
                linked += 1;
            }
        }
        tracing::info!(doc_id = %doc_id, entity_links = linked, "AI enrichment persisted");

        // Vectorize: refined text + heading + visual summary.
        let embedding_texts: Vec<String> = chunks
            .iter()
            .zip(updates.iter())
            .map(|(chunk, update)| {
                build_embedding_text(&chunk.heading_full, &update.text, &update.visual_summary)
            })
            .collect();
        let vectors = self
            .embedder
            .embed_documents(&embedding_texts)
            .await
            .map_err(|e| IngestError::Embedding(e.to_string()))?;
        if vectors.len() != chunks.len() {
            return Err(IngestError::Embedding(format!(
                "embedded {} of {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        // Index under the chunk ids.
        let points: Vec<IndexPoint> = chunks
            .iter()
            .zip(updates.iter())
            .zip(chunk_ids.iter())
            .zip(vectors.into_iter())
            .map(|(((chunk, update), chunk_id), vector)| IndexPoint {
                chunk_id: *chunk_id,
                doc_id,
                search_text: build_search_text(
                    &chunk.heading_full,
                    &update.text,
                    &update.visual_summary,
                ),
                vector,
            })
            .collect();
        self.index
            .upsert_points(&points)
            .await
            .map_err(|e| IngestError::Index(e.to_string()))?;

        let duration_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            doc_id = %doc_id,
            chunks = chunk_ids.len(),
            duration_secs,
            "Ingest complete"
        );

        Ok(IngestReport {
            status: IngestStatus::Success,
            doc_id: Some(doc_id),
            filename: filename.to_string(),
            chunks_count: chunk_ids.len(),
            duration_secs,
            error: None,
        })
    }
}
