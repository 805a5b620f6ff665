pub mod cross_encoder;
pub mod hosted;

use anyhow::Result;
use async_trait::async_trait;

pub use cross_encoder::CrossEncoderReranker;
pub use hosted::HostedReranker;

use crate::types::{ChunkRow, RankedChunk};

/// Cross-encoder scoring of (query, passage) pairs. Returns
/// `(passage_index, score)` sorted by score descending, truncated to
/// `top_n`. The upstream retrieval score is never an input.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_n: usize,
    ) -> Result<Vec<(usize, f32)>>;
}

/// Text submitted to the cross-encoder for one chunk: visual/table facts,
/// heading context, then the raw body, with empty sections omitted.
pub fn build_rerank_text(chunk: &ChunkRow) -> String {
    let mut sections = Vec::new();

    if !chunk.visual_summary.is_empty() {
        sections.push(format!(
            "[VISUAL AND TABLE CONTENT]\n{}",
            chunk.visual_summary
        ));
    }
    if !chunk.heading_full.is_empty() {
        sections.push(format!("[TITLE/CONTEXT]\n{}", chunk.heading_full));
    }
    if !chunk.text.is_empty() {
        sections.push(format!("[RAW TEXT]\n{}", chunk.text));
    }

    sections.join("\n\n")
}

/// Rerank hydrated chunks against the canonical query. Scores below
/// `min_score` are discarded. On reranker failure the original retrieved
/// order is kept, truncated to `top_n`, with the fused score carried over.
pub async fn rerank_chunks(
    reranker: &dyn Reranker,
    query: &str,
    chunks: Vec<(ChunkRow, f32)>,
    top_n: usize,
    min_score: f32,
) -> Vec<RankedChunk> {
    if chunks.is_empty() {
        return Vec::new();
    }

    let passages: Vec<String> = chunks
        .iter()
        .map(|(chunk, _)| build_rerank_text(chunk))
        .collect();

    match reranker.rerank(query, &passages, top_n).await {
        Ok(scored) => scored
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .filter_map(|(idx, score)| {
                chunks.get(idx).map(|(chunk, _)| RankedChunk {
                    chunk: chunk.clone(),
                    rerank_score: score,
                })
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Reranking failed, keeping retrieval order");
            chunks
                .into_iter()
                .take(top_n)
                .map(|(chunk, fused_score)| RankedChunk {
                    chunk,
                    rerank_score: fused_score,
                })
                .collect()
        }
    }
}
