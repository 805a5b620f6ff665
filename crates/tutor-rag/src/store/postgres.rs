use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::types::{
    AiUpdate, ChunkKind, ChunkRow, DocumentRecord, EnrichedChunk, IDENTITY_CHUNK_INDEX,
    IDENTITY_HEADING,
};

/// Relational persistence for documents, chunks, entities and entity links.
/// All multi-row writes run inside a single transaction; partial failure
/// rolls back.
pub struct DocumentStore {
    pool: PgPool,
}

impl DocumentStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .connect(&config.url())
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indices. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS pgcrypto",
            r#"CREATE TABLE IF NOT EXISTS documents (
                doc_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                filename TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS chunks (
                chunk_id UUID PRIMARY KEY,
                doc_id UUID NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                chunk_visual_summary TEXT NOT NULL DEFAULT '',
                chunk_headings JSONB NOT NULL DEFAULT '[]',
                chunk_heading_full TEXT NOT NULL DEFAULT '',
                chunk_page_numbers INTEGER[] NOT NULL DEFAULT '{}',
                chunk_tables JSONB NOT NULL DEFAULT '[]',
                chunk_images_urls TEXT[] NOT NULL DEFAULT '{}',
                chunk_type VARCHAR(20) NOT NULL DEFAULT 'content',
                is_identity BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT check_chunk_type CHECK (chunk_type IN ('identity', 'content', 'toc'))
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc_index ON chunks(doc_id, chunk_index)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_type ON chunks(chunk_type)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_identity ON chunks(is_identity) WHERE is_identity = TRUE",
            "CREATE INDEX IF NOT EXISTS idx_chunks_heading_gin ON chunks USING GIN (chunk_headings)",
            r#"CREATE TABLE IF NOT EXISTS entities (
                entity_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name TEXT NOT NULL UNIQUE,
                aliases TEXT[] NOT NULL DEFAULT '{}',
                entity_type VARCHAR(40) NOT NULL DEFAULT 'CONCEPT',
                global_summary TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_entities_aliases_gin ON entities USING GIN (aliases)",
            r#"CREATE TABLE IF NOT EXISTS entity_links (
                link_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                entity_id UUID NOT NULL REFERENCES entities(entity_id) ON DELETE CASCADE,
                chunk_id UUID NOT NULL REFERENCES chunks(chunk_id) ON DELETE CASCADE,
                relevance_score REAL NOT NULL DEFAULT 1.0,
                context_description TEXT,
                UNIQUE(entity_id, chunk_id)
            )"#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Schema initialization failed")?;
        }

        tracing::info!("Document store schema ready");
        Ok(())
    }

    /// Idempotent document creation keyed by filename. Re-ingesting a known
    /// filename returns the existing doc_id.
    pub async fn upsert_document(&self, filename: &str) -> Result<Uuid> {
        let row = sqlx::query(
            r#"INSERT INTO documents (filename) VALUES ($1)
               ON CONFLICT (filename) DO UPDATE SET filename = EXCLUDED.filename
               RETURNING doc_id"#,
        )
        .bind(filename)
        .fetch_one(&self.pool)
        .await
        .context("upsert_document failed")?;

        Ok(row.try_get("doc_id")?)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            "SELECT doc_id, filename, created_at FROM documents ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_documents failed")?;

        rows.iter()
            .map(|row| {
                Ok(DocumentRecord {
                    doc_id: row.try_get("doc_id")?,
                    filename: row.try_get("filename")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Insert content chunks in one transaction, returning their ids in
    /// input order.
    pub async fn insert_chunk_batch(
        &self,
        doc_id: Uuid,
        chunks: &[EnrichedChunk],
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.context("begin chunk batch")?;
        let mut chunk_ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let chunk_id = Uuid::new_v4();
            sqlx::query(
                r#"INSERT INTO chunks (
                    chunk_id, doc_id, chunk_index, chunk_text,
                    chunk_visual_summary, chunk_headings, chunk_heading_full,
                    chunk_page_numbers, chunk_tables, chunk_images_urls,
                    chunk_type, is_identity
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            )
            .bind(chunk_id)
            .bind(doc_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind("")
            .bind(serde_json::to_value(&chunk.headings)?)
            .bind(&chunk.heading_full)
            .bind(&chunk.page_numbers)
            .bind(serde_json::to_value(&chunk.tables)?)
            .bind(&chunk.images_urls)
            .bind(ChunkKind::Content.as_str())
            .bind(false)
            .execute(&mut *tx)
            .await
            .context("chunk insert failed")?;

            chunk_ids.push(chunk_id);
        }

        tx.commit().await.context("commit chunk batch")?;
        tracing::info!(doc_id = %doc_id, chunks = chunk_ids.len(), "Stored chunk batch");
        Ok(chunk_ids)
    }

    /// Insert the document identity card. `pages_sampled` entries outside
    /// the valid page range were already dropped upstream; an empty list
    /// stores the `[1000]` sentinel so the column is never empty.
    pub async fn insert_identity_chunk(
        &self,
        doc_id: Uuid,
        identity_text: &str,
        pages_sampled: &[i32],
    ) -> Result<Uuid> {
        let pages = sanitize_sampled_pages(pages_sampled);
        let chunk_id = Uuid::new_v4();

        sqlx::query(
            r#"INSERT INTO chunks (
                chunk_id, doc_id, chunk_index, chunk_text,
                chunk_visual_summary, chunk_headings, chunk_heading_full,
                chunk_page_numbers, chunk_tables, chunk_images_urls,
                chunk_type, is_identity
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(chunk_id)
        .bind(doc_id)
        .bind(IDENTITY_CHUNK_INDEX)
        .bind(identity_text)
        .bind("")
        .bind(serde_json::to_value(vec![IDENTITY_HEADING.to_string()])?)
        .bind(IDENTITY_HEADING)
        .bind(&pages)
        .bind(serde_json::to_value(Vec::<String>::new())?)
        .bind(Vec::<String>::new())
        .bind(ChunkKind::Identity.as_str())
        .bind(true)
        .execute(&self.pool)
        .await
        .context("identity chunk insert failed")?;

        tracing::info!(doc_id = %doc_id, chunk_id = %chunk_id, "Stored identity chunk");
        Ok(chunk_id)
    }

    /// Apply AI enrichment results (refined text + visual summary) in one
    /// transaction.
    pub async fn update_chunks_ai(&self, updates: &[AiUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("begin AI update")?;
        for update in updates {
            sqlx::query(
                "UPDATE chunks SET chunk_text = $1, chunk_visual_summary = $2 WHERE chunk_id = $3",
            )
            .bind(&update.text)
            .bind(&update.visual_summary)
            .bind(update.chunk_id)
            .execute(&mut *tx)
            .await
            .context("AI update failed")?;
        }
        tx.commit().await.context("commit AI update")?;

        tracing::info!(chunks = updates.len(), "Applied AI enrichment updates");
        Ok(())
    }

    pub async fn fetch_chunks_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ChunkRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!("{CHUNK_COLUMNS} WHERE chunk_id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("fetch_chunks_by_ids failed")?;

        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn fetch_identities_by_doc_ids(&self, doc_ids: &[Uuid]) -> Result<Vec<ChunkRow>> {
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "{CHUNK_COLUMNS} WHERE doc_id = ANY($1) AND is_identity = TRUE"
        ))
        .bind(doc_ids)
        .fetch_all(&self.pool)
        .await
        .context("fetch_identities_by_doc_ids failed")?;

        rows.iter().map(row_to_chunk).collect()
    }
}

const CHUNK_COLUMNS: &str = r#"SELECT
    chunk_id, doc_id, chunk_index, chunk_text, chunk_visual_summary,
    chunk_headings, chunk_heading_full, chunk_page_numbers, chunk_tables,
    chunk_images_urls, chunk_type, is_identity, created_at
FROM chunks"#;

fn row_to_chunk(row: &PgRow) -> Result<ChunkRow> {
    let headings: serde_json::Value = row.try_get("chunk_headings")?;
    let tables: serde_json::Value = row.try_get("chunk_tables")?;
    let chunk_type: String = row.try_get("chunk_type")?;

    Ok(ChunkRow {
        chunk_id: row.try_get("chunk_id")?,
        doc_id: row.try_get("doc_id")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("chunk_text")?,
        visual_summary: row.try_get("chunk_visual_summary")?,
        headings: serde_json::from_value(headings).unwrap_or_default(),
        heading_full: row.try_get("chunk_heading_full")?,
        page_numbers: row.try_get("chunk_page_numbers")?,
        tables: serde_json::from_value(tables).unwrap_or_default(),
        images_urls: row.try_get("chunk_images_urls")?,
        chunk_type: ChunkKind::from_str(&chunk_type),
        is_identity: row.try_get("is_identity")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Sampled pages for the identity chunk: drop negatives, fall back to the
/// `[1000]` sentinel when nothing valid remains.
fn sanitize_sampled_pages(pages: &[i32]) -> Vec<i32> {
    let clean: Vec<i32> = pages.iter().copied().filter(|p| *p >= 0).collect();
    if clean.is_empty() {
        vec![1000]
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_pages_fall_back_to_sentinel() {
        assert_eq!(sanitize_sampled_pages(&[]), vec![1000]);
        assert_eq!(sanitize_sampled_pages(&[-3, -1]), vec![1000]);
        assert_eq!(sanitize_sampled_pages(&[0]), vec![0]);
        assert_eq!(sanitize_sampled_pages(&[2, -1, 5]), vec![2, 5]);
    }
}
