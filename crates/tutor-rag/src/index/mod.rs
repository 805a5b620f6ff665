//! Hybrid vector index: dense ANN search (Lance) plus a BM25 lexical
//! index (Tantivy), fused with reciprocal rank fusion at query time.

pub mod hybrid;
pub mod lance;
pub mod lexical;

use anyhow::Result;
use std::path::Path;
use uuid::Uuid;

pub use hybrid::reciprocal_rank_fusion;
pub use lance::DenseIndex;
pub use lexical::LexicalIndex;

/// One indexable point: the chunk id, its document, the searchable text
/// and the dense vector.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub search_text: String,
    pub vector: Vec<f32>,
}

/// Searchable text for a chunk: heading path, body and visual summary
/// concatenated. The same text feeds both the dense payload and the
/// lexical index.
pub fn build_search_text(heading_full: &str, text: &str, visual_summary: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    if !heading_full.is_empty() {
        parts.push(heading_full);
    }
    parts.push(text);
    if !visual_summary.is_empty() {
        parts.push(visual_summary);
    }
    parts.join("\n")
}

/// The hybrid index over one logical collection.
pub struct VectorIndex {
    dense: DenseIndex,
    lexical: LexicalIndex,
}

impl VectorIndex {
    pub async fn open(data_dir: &Path, collection: &str, dimension: usize) -> Result<Self> {
        let dense_path = data_dir.join("lance");
        let dense = DenseIndex::open(
            dense_path.to_str().unwrap_or("./lance"),
            collection,
            dimension,
        )
        .await?;
        let lexical = LexicalIndex::open(data_dir, collection)?;

        tracing::info!(collection = collection, dimension = dimension, "Vector index ready");
        Ok(Self { dense, lexical })
    }

    /// Upsert into both sides of the index; returns once both are
    /// searchable.
    pub async fn upsert_points(&self, points: &[IndexPoint]) -> Result<()> {
        self.dense.upsert_points(points).await?;
        let lexical_entries: Vec<(Uuid, Uuid, String)> = points
            .iter()
            .map(|p| (p.chunk_id, p.doc_id, p.search_text.clone()))
            .collect();
        self.lexical.upsert_batch(&lexical_entries)?;
        Ok(())
    }

    pub async fn dense_search(
        &self,
        vector: &[f32],
        k: usize,
        doc_filter: Option<Uuid>,
        score_threshold: f32,
    ) -> Result<Vec<(Uuid, f32)>> {
        self.dense.search(vector, k, doc_filter, score_threshold).await
    }

    pub fn lexical_search(
        &self,
        terms: &str,
        k: usize,
        doc_filter: Option<Uuid>,
    ) -> Result<Vec<(Uuid, f32)>> {
        self.lexical.search(terms, k, doc_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_text_concatenates_non_empty_fields() {
        let text = build_search_text("Chapter 1 > Rites", "The miqat is a boundary.", "");
        assert_eq!(text, "Chapter 1 > Rites\nThe miqat is a boundary.");

        let with_summary = build_search_text("", "Body.", "Table lists five stations.");
        assert_eq!(with_summary, "Body.\nTable lists five stations.");
    }

    /// Hybrid recall: an exact keyword hit and a semantic paraphrase both
    /// outrank an unrelated chunk after fusion.
    #[test]
    fn fusion_ranks_keyword_and_semantic_hits_above_noise() {
        let dir = tempfile::tempdir().unwrap();
        let lexical = LexicalIndex::open(dir.path(), "chunks_development").unwrap();

        let doc_id = Uuid::new_v4();
        let a = Uuid::new_v4(); // exact keyword "miqat"
        let b = Uuid::new_v4(); // semantic paraphrase
        let c = Uuid::new_v4(); // unrelated
        lexical
            .upsert_batch(&[
                (a, doc_id, "The miqat is fixed before entering ihram.".to_string()),
                (b, doc_id, "The boundary of consecration for pilgrims.".to_string()),
                (c, doc_id, "Rice cooking instructions for beginners.".to_string()),
            ])
            .unwrap();

        let lexical_list = lexical.search("miqat", 10, None).unwrap();
        assert_eq!(lexical_list[0].0, a);

        // Dense leg (simulated embedder output): paraphrase first.
        let dense_list = vec![(b, 0.92), (a, 0.55), (c, 0.06)];

        let fused = reciprocal_rank_fusion(&[dense_list, lexical_list], 60, 10);
        let rank = |id: Uuid| fused.iter().position(|(i, _)| *i == id).unwrap();
        assert!(rank(a) < rank(c));
        assert!(rank(b) < rank(c));
    }
}
