use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel `chunk_index` of the identity chunk. Content chunks are
/// numbered from 0.
pub const IDENTITY_CHUNK_INDEX: i32 = -1;

/// Heading assigned to chunks whose extracted heading was rejected as noise.
pub const GENERAL_SECTION: &str = "General section";

/// Heading stored on identity chunks.
pub const IDENTITY_HEADING: &str = "DOCUMENT_IDENTITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Identity,
    Content,
    Toc,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Content => "content",
            Self::Toc => "toc",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "identity" => Self::Identity,
            "toc" => Self::Toc,
            _ => Self::Content,
        }
    }
}

/// Vertical/horizontal extent of a layout item, in page units with the
/// top edge greater than the bottom edge (PDF convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub l: f32,
    pub t: f32,
    pub r: f32,
    pub b: f32,
}

impl BBox {
    pub fn height(&self) -> f32 {
        (self.t - self.b).abs()
    }
}

/// Raster payload of a picture item: encoded bytes plus pixel dimensions.
#[derive(Debug, Clone)]
pub struct PictureData {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocItemKind {
    Text,
    Heading { level: u8 },
    Table,
    Picture,
}

/// One structured item emitted by the layout parser. The core never looks
/// past this record into parser internals.
#[derive(Debug, Clone)]
pub struct DocItem {
    pub kind: DocItemKind,
    pub page: u32,
    pub bbox: Option<BBox>,
    /// Text payload: body text, heading text, or table markdown.
    pub text: String,
    pub picture: Option<PictureData>,
}

impl DocItem {
    pub fn text(page: u32, text: impl Into<String>) -> Self {
        Self {
            kind: DocItemKind::Text,
            page,
            bbox: None,
            text: text.into(),
            picture: None,
        }
    }

    pub fn heading(page: u32, level: u8, text: impl Into<String>) -> Self {
        Self {
            kind: DocItemKind::Heading { level },
            page,
            bbox: None,
            text: text.into(),
            picture: None,
        }
    }

    pub fn table(page: u32, markdown: impl Into<String>) -> Self {
        Self {
            kind: DocItemKind::Table,
            page,
            bbox: None,
            text: markdown.into(),
            picture: None,
        }
    }
}

/// Output of the layout parser for one PDF.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub page_count: usize,
    pub items: Vec<DocItem>,
    /// Flattened markdown rendering of the whole document, used for
    /// identity-card sampling and TOC detection.
    pub markdown: String,
    pub scanned: bool,
}

impl ParsedDocument {
    pub fn pictures(&self) -> impl Iterator<Item = (usize, &DocItem)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, it)| it.kind == DocItemKind::Picture)
    }
}

/// Chunk emitted by the hierarchical chunker, before structural enrichment.
#[derive(Debug, Clone)]
pub struct ProvisionalChunk {
    pub text: String,
    /// Heading path root→leaf.
    pub headings: Vec<String>,
    pub pages: Vec<u32>,
    /// Indices into `ParsedDocument::items` of the items this chunk covers.
    pub item_indices: Vec<usize>,
}

/// Chunk after structural enrichment and splitting, ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedChunk {
    pub chunk_index: i32,
    pub text: String,
    pub headings: Vec<String>,
    pub heading_full: String,
    pub page_numbers: Vec<i32>,
    pub tables: Vec<String>,
    pub images_urls: Vec<String>,
    #[serde(default)]
    pub is_table_continuation: bool,
    #[serde(default)]
    pub is_table_cut: bool,
}

/// Persisted chunk record as read back from the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub chunk_index: i32,
    pub text: String,
    pub visual_summary: String,
    pub headings: Vec<String>,
    pub heading_full: String,
    pub page_numbers: Vec<i32>,
    pub tables: Vec<String>,
    pub images_urls: Vec<String>,
    pub chunk_type: ChunkKind,
    pub is_identity: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: Uuid,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Entity extracted by the enrichment workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_relevance")]
    pub relevance: f32,
}

fn default_entity_type() -> String {
    "CONCEPT".to_string()
}

fn default_relevance() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: Uuid,
    pub name: String,
    pub aliases: Vec<String>,
    pub entity_type: String,
    pub global_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-chunk result of AI enrichment, applied back to the store in one
/// transaction.
#[derive(Debug, Clone)]
pub struct AiUpdate {
    pub chunk_id: Uuid,
    pub text: String,
    pub visual_summary: String,
    pub entities: Vec<ExtractedEntity>,
}

/// Chunk surviving the reranker, with its cross-encoder score.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: ChunkRow,
    pub rerank_score: f32,
}

/// One element of the final grouped context handed to the answer
/// assembler: either a document identity card or a ranked content chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    #[serde(flatten)]
    pub chunk: ChunkRow,
    pub rerank_score: Option<f32>,
}

impl ContextItem {
    pub fn identity(chunk: ChunkRow) -> Self {
        Self {
            chunk,
            rerank_score: None,
        }
    }

    pub fn ranked(ranked: RankedChunk) -> Self {
        Self {
            chunk: ranked.chunk,
            rerank_score: Some(ranked.rerank_score),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Failed,
}

/// Per-file outcome of a bulk ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub doc_id: Option<Uuid>,
    pub filename: String,
    pub chunks_count: usize,
    pub duration_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkIngestSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<IngestReport>,
}

/// Response of the query pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub standalone_query: String,
    pub config_applied: String,
    pub chunks_count: usize,
    pub sources: Vec<ContextItem>,
}

pub fn join_headings(headings: &[String]) -> String {
    headings.join(" > ")
}

/// Inverse of [`join_headings`]. Keeps `heading_full == join(headings)`
/// after heading hygiene or continuation suffixes rewrite the full form.
pub fn headings_from_full(heading_full: &str) -> Vec<String> {
    if heading_full.is_empty() {
        return Vec::new();
    }
    heading_full
        .split(" > ")
        .map(|part| part.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_full_is_joined_path() {
        let headings = vec!["Chapter 1".to_string(), "Section 1.1".to_string()];
        assert_eq!(join_headings(&headings), "Chapter 1 > Section 1.1");
        assert_eq!(join_headings(&[]), "");
    }

    #[test]
    fn headings_round_trip_through_full_form() {
        let headings = vec!["Chapter 1".to_string(), "Section 1.1".to_string()];
        assert_eq!(headings_from_full(&join_headings(&headings)), headings);
        assert!(headings_from_full("").is_empty());
    }

    #[test]
    fn chunk_kind_round_trips() {
        for kind in [ChunkKind::Identity, ChunkKind::Content, ChunkKind::Toc] {
            assert_eq!(ChunkKind::from_str(kind.as_str()), kind);
        }
        // Unknown labels degrade to content.
        assert_eq!(ChunkKind::from_str("mystery"), ChunkKind::Content);
    }

    #[test]
    fn bbox_height_handles_pdf_coordinates() {
        let bbox = BBox {
            l: 0.0,
            t: 700.0,
            r: 100.0,
            b: 500.0,
        };
        assert_eq!(bbox.height(), 200.0);
    }
}
