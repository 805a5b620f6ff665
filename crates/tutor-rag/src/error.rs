use thiserror::Error;

/// Errors raised by the ingestion pipeline, classified by stage.
///
/// `Enrichment` and `Blob` are recovered locally (the chunk proceeds with
/// empty visual data); everything else is terminal for the document being
/// ingested. Bulk ingestion catches these at the per-document boundary and
/// continues with the next file.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("input error: {0}")]
    Input(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("chunking error: {0}")]
    Chunking(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("enrichment error: {0}")]
    Enrichment(String),

    #[error("blob upload error: {0}")]
    Blob(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("index error: {0}")]
    Index(String),
}

impl IngestError {
    /// Stage label used in structured logs and ingest reports.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Parse(_) => "parse",
            Self::Chunking(_) => "chunk",
            Self::Persistence(_) => "persist",
            Self::Enrichment(_) => "enrich",
            Self::Blob(_) => "blob",
            Self::Embedding(_) => "vectorize",
            Self::Index(_) => "index",
        }
    }

    /// Whether the pipeline may continue with degraded data instead of
    /// failing the document.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Enrichment(_) | Self::Blob(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_stages() {
        assert!(IngestError::Enrichment("timeout".into()).is_recoverable());
        assert!(IngestError::Blob("upload failed".into()).is_recoverable());
        assert!(!IngestError::Embedding("dim mismatch".into()).is_recoverable());
        assert!(!IngestError::Persistence("tx rollback".into()).is_recoverable());
    }

    #[test]
    fn stage_labels() {
        assert_eq!(IngestError::Parse("x".into()).stage(), "parse");
        assert_eq!(IngestError::Index("x".into()).stage(), "index");
    }
}
