//! Query pipeline: rewrite, concurrent hybrid retrieval, rank fusion,
//! hydration, cross-encoder reranking and document-grouped context
//! assembly. Every step degrades gracefully; only a document-store
//! failure fails the request.

pub mod answer;
pub mod rewriter;
pub mod session;

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BenchConfig, GeneratorConfig, SearchConfig};
use crate::embedding::Embedder;
use crate::index::{reciprocal_rank_fusion, VectorIndex};
use crate::llm::Generator;
use crate::reranking::{rerank_chunks, Reranker};
use crate::store::DocumentStore;
use crate::types::{ChunkRow, ContextItem, QueryResponse, RankedChunk};

pub use session::ChatSession;

pub struct QueryPipeline {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    generator: Arc<dyn Generator>,
    search: SearchConfig,
    generation: GeneratorConfig,
    min_rerank_score: f32,
}

impl QueryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        generator: Arc<dyn Generator>,
        search: SearchConfig,
        generation: GeneratorConfig,
        min_rerank_score: f32,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            reranker,
            generator,
            search,
            generation,
            min_rerank_score,
        }
    }

    /// Answer one question against the ingested corpus.
    pub async fn query(
        &self,
        question: &str,
        session: &mut ChatSession,
        doc_filter: Option<Uuid>,
        config_id: &str,
        config: &BenchConfig,
    ) -> Result<QueryResponse> {
        let rewritten = rewriter::rewrite_query(&self.generator, question, session).await;
        tracing::info!(
            question = question,
            canonical = %rewritten.canonical,
            variants = rewritten.variants.len(),
            "Query rewritten"
        );

        let fused = self.fan_out(&rewritten, config.top_k, doc_filter).await;
        let hydrated = self.hydrate(&fused).await?;
        tracing::info!(
            fused = fused.len(),
            hydrated = hydrated.len(),
            "Retrieval candidates ready"
        );

        let ranked = rerank_chunks(
            self.reranker.as_ref(),
            &rewritten.canonical,
            hydrated,
            config.top_n,
            self.min_rerank_score,
        )
        .await;

        let doc_ids = unique_doc_ids(&ranked);
        let identities = self
            .store
            .fetch_identities_by_doc_ids(&doc_ids)
            .await
            .context("identity hydration failed")?;
        let context = group_by_document(ranked, identities);

        if context.is_empty() {
            tracing::info!(question = question, "No grounded context found");
            return Ok(QueryResponse {
                answer: answer::NO_CONTEXT_ANSWER.to_string(),
                standalone_query: rewritten.canonical,
                config_applied: config_id.to_string(),
                chunks_count: 0,
                sources: Vec::new(),
            });
        }

        let reply = answer::generate_answer(
            &self.generator,
            question,
            &context,
            session,
            config.prompt_style,
            self.generation.answer_max_tokens,
        )
        .await;

        Ok(QueryResponse {
            answer: reply,
            standalone_query: rewritten.canonical,
            config_applied: config_id.to_string(),
            chunks_count: context.len(),
            sources: context,
        })
    }

    /// Concurrent retrieval: every variant is embedded while the keyword
    /// string runs through the lexical index (recall-oriented, never
    /// doc-filtered); the dense searches then fan out together. The
    /// resulting ranked lists are RRF-fused.
    async fn fan_out(
        &self,
        rewritten: &rewriter::RewrittenQuery,
        top_k: usize,
        doc_filter: Option<Uuid>,
    ) -> Vec<(Uuid, f32)> {
        let embeds = join_all(
            rewritten
                .variants
                .iter()
                .map(|variant| self.embedder.embed_query(variant)),
        );
        let lexical = async { self.index.lexical_search(&rewritten.keywords, top_k, None) };
        let (embed_results, lexical_result) = tokio::join!(embeds, lexical);

        let vectors: Vec<Vec<f32>> = embed_results
            .into_iter()
            .filter_map(|result| match result {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(error = %e, "Variant embedding failed, skipping list");
                    None
                }
            })
            .collect();

        let dense_lists = join_all(vectors.iter().map(|vector| {
            self.index.dense_search(
                vector,
                top_k,
                doc_filter,
                self.search.dense_score_threshold,
            )
        }))
        .await;

        let mut ranked_lists: Vec<Vec<(Uuid, f32)>> = Vec::new();
        for list in dense_lists {
            match list {
                Ok(list) => ranked_lists.push(list),
                Err(e) => tracing::warn!(error = %e, "Dense search failed, skipping list"),
            }
        }
        match lexical_result {
            Ok(list) => ranked_lists.push(list),
            Err(e) => tracing::warn!(error = %e, "Lexical search failed, skipping list"),
        }

        reciprocal_rank_fusion(&ranked_lists, self.search.rrf_k, top_k)
    }

    /// Fetch full chunk records for the fused ids, preserving fusion order
    /// and dropping ids the store no longer knows (stale index entries).
    async fn hydrate(&self, fused: &[(Uuid, f32)]) -> Result<Vec<(ChunkRow, f32)>> {
        let ids: Vec<Uuid> = fused.iter().map(|(id, _)| *id).collect();
        let rows = self
            .store
            .fetch_chunks_by_ids(&ids)
            .await
            .context("chunk hydration failed")?;

        let mut by_id: HashMap<Uuid, ChunkRow> =
            rows.into_iter().map(|row| (row.chunk_id, row)).collect();

        Ok(fused
            .iter()
            .filter_map(|(id, score)| by_id.remove(id).map(|row| (row, *score)))
            .collect())
    }
}

fn unique_doc_ids(ranked: &[RankedChunk]) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    ranked
        .iter()
        .filter_map(|r| seen.insert(r.chunk.doc_id).then_some(r.chunk.doc_id))
        .collect()
}

/// Group surviving chunks by document: documents ordered by their best
/// rerank score, each opened by its identity card (when one exists) and
/// followed by its chunks in reading order.
pub fn group_by_document(
    ranked: Vec<RankedChunk>,
    identities: Vec<ChunkRow>,
) -> Vec<ContextItem> {
    if ranked.is_empty() {
        return Vec::new();
    }

    let mut identity_by_doc: HashMap<Uuid, ChunkRow> = identities
        .into_iter()
        .map(|row| (row.doc_id, row))
        .collect();

    let mut best_score: HashMap<Uuid, f32> = HashMap::new();
    let mut chunks_by_doc: HashMap<Uuid, Vec<RankedChunk>> = HashMap::new();
    for chunk in ranked {
        let entry = best_score.entry(chunk.chunk.doc_id).or_insert(f32::MIN);
        *entry = entry.max(chunk.rerank_score);
        chunks_by_doc
            .entry(chunk.chunk.doc_id)
            .or_default()
            .push(chunk);
    }

    let mut doc_order: Vec<(Uuid, f32)> = best_score.into_iter().collect();
    doc_order.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut context = Vec::new();
    for (doc_id, _) in doc_order {
        if let Some(identity) = identity_by_doc.remove(&doc_id) {
            context.push(ContextItem::identity(identity));
        }
        let mut chunks = chunks_by_doc.remove(&doc_id).unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk.chunk_index);
        context.extend(chunks.into_iter().map(ContextItem::ranked));
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkKind, IDENTITY_CHUNK_INDEX};
    use chrono::Utc;

    fn chunk(doc_id: Uuid, index: i32, identity: bool) -> ChunkRow {
        ChunkRow {
            chunk_id: Uuid::new_v4(),
            doc_id,
            chunk_index: index,
            text: format!("chunk {index}"),
            visual_summary: String::new(),
            headings: vec![],
            heading_full: String::new(),
            page_numbers: vec![],
            tables: vec![],
            images_urls: vec![],
            chunk_type: if identity {
                ChunkKind::Identity
            } else {
                ChunkKind::Content
            },
            is_identity: identity,
            created_at: Utc::now(),
        }
    }

    fn ranked(doc_id: Uuid, index: i32, score: f32) -> RankedChunk {
        RankedChunk {
            chunk: chunk(doc_id, index, false),
            rerank_score: score,
        }
    }

    #[test]
    fn documents_are_ordered_by_best_score() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let context = group_by_document(
            vec![
                ranked(doc_a, 0, 0.4),
                ranked(doc_b, 2, 0.9),
                ranked(doc_a, 1, 0.5),
            ],
            vec![
                chunk(doc_a, IDENTITY_CHUNK_INDEX, true),
                chunk(doc_b, IDENTITY_CHUNK_INDEX, true),
            ],
        );

        // doc_b (best 0.9) leads: identity then its chunk; doc_a follows.
        assert_eq!(context.len(), 5);
        assert!(context[0].chunk.is_identity);
        assert_eq!(context[0].chunk.doc_id, doc_b);
        assert_eq!(context[1].chunk.doc_id, doc_b);
        assert!(context[2].chunk.is_identity);
        assert_eq!(context[2].chunk.doc_id, doc_a);
    }

    #[test]
    fn chunks_within_a_document_follow_reading_order() {
        let doc = Uuid::new_v4();
        let context = group_by_document(
            vec![ranked(doc, 7, 0.9), ranked(doc, 2, 0.3), ranked(doc, 4, 0.6)],
            vec![chunk(doc, IDENTITY_CHUNK_INDEX, true)],
        );

        let indices: Vec<i32> = context
            .iter()
            .filter(|c| !c.chunk.is_identity)
            .map(|c| c.chunk.chunk_index)
            .collect();
        assert_eq!(indices, vec![2, 4, 7]);
    }

    #[test]
    fn identity_appears_once_and_first_per_document() {
        let doc = Uuid::new_v4();
        let context = group_by_document(
            vec![ranked(doc, 0, 0.5), ranked(doc, 1, 0.4)],
            vec![chunk(doc, IDENTITY_CHUNK_INDEX, true)],
        );

        let identity_positions: Vec<usize> = context
            .iter()
            .enumerate()
            .filter(|(_, c)| c.chunk.is_identity)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(identity_positions, vec![0]);
    }

    #[test]
    fn missing_identity_still_yields_chunks() {
        let doc = Uuid::new_v4();
        let context = group_by_document(vec![ranked(doc, 0, 0.5)], vec![]);
        assert_eq!(context.len(), 1);
        assert!(!context[0].chunk.is_identity);
    }

    #[test]
    fn empty_rank_list_yields_empty_context() {
        assert!(group_by_document(vec![], vec![]).is_empty());
    }
}
