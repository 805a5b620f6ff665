pub mod hosted;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;

pub use hosted::HostedEmbedder;
pub use local::LocalEmbedder;

/// Dense embedding provider. Both methods yield vectors of `dimension()`;
/// implementations must not block the async runtime (CPU-bound encoders
/// run on the blocking pool).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// Instructional prefix prepended to queries before embedding.
pub const QUERY_INSTRUCTION: &str =
    "Represent this sentence for searching relevant passages: ";

/// Text embedded for a chunk: the heading path as a markdown title when a
/// real heading exists, the body, and the visual summary when present.
pub fn build_embedding_text(heading_full: &str, text: &str, visual_summary: &str) -> String {
    let has_real_heading = !heading_full.is_empty()
        && heading_full != crate::types::GENERAL_SECTION
        && heading_full != crate::types::IDENTITY_HEADING;

    let mut out = if has_real_heading {
        format!("# {}\n\n{}", heading_full, text)
    } else {
        text.to_string()
    };

    if !visual_summary.is_empty() {
        out.push_str("\n\n");
        out.push_str(visual_summary);
    }
    out
}
