//! Bounded AI enrichment workers. Each chunk carrying tables or images
//! gets one structured-JSON generator call producing additional visual
//! facts and extracted entities; everything else bypasses the generator.

use futures::future::join_all;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::llm::{ContentPart, GenerationRequest, Generator};
use crate::types::{AiUpdate, EnrichedChunk, ExtractedEntity};

/// Maximum concurrent generator calls across all in-flight ingests.
const ENRICHMENT_CONCURRENCY: usize = 10;
const ENRICHMENT_MAX_TOKENS: u32 = 1500;

#[derive(Debug, Deserialize)]
struct EnrichmentPayload {
    #[serde(default)]
    visual_summary: String,
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
}

pub struct ChunkEnricher {
    generator: Arc<dyn Generator>,
    semaphore: Arc<Semaphore>,
}

impl ChunkEnricher {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            semaphore: Arc::new(Semaphore::new(ENRICHMENT_CONCURRENCY)),
        }
    }

    /// Enrich every chunk, bounded by the global semaphore. Failures
    /// degrade to an empty summary and no entities; the returned updates
    /// are index-aligned with the input.
    pub async fn enrich_all(&self, chunks: &[EnrichedChunk], chunk_ids: &[Uuid]) -> Vec<AiUpdate> {
        let tasks = chunks
            .iter()
            .zip(chunk_ids.iter())
            .map(|(chunk, chunk_id)| self.enrich_one(chunk, *chunk_id));
        join_all(tasks).await
    }

    async fn enrich_one(&self, chunk: &EnrichedChunk, chunk_id: Uuid) -> AiUpdate {
        if chunk.tables.is_empty() && chunk.images_urls.is_empty() {
            return AiUpdate {
                chunk_id,
                text: chunk.text.clone(),
                visual_summary: String::new(),
                entities: Vec::new(),
            };
        }

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return AiUpdate {
                    chunk_id,
                    text: chunk.text.clone(),
                    visual_summary: String::new(),
                    entities: Vec::new(),
                }
            }
        };

        tracing::debug!(
            chunk_id = %chunk_id,
            tables = chunk.tables.len(),
            images = chunk.images_urls.len(),
            "Enriching chunk"
        );

        match self.call_generator(chunk).await {
            Ok(payload) => {
                let text = if payload.visual_summary.is_empty() {
                    chunk.text.clone()
                } else {
                    let stripped = strip_table_noise(&chunk.text);
                    // A chunk that was pure table keeps its body; empty
                    // chunk text is never persisted.
                    if stripped.is_empty() {
                        chunk.text.clone()
                    } else {
                        stripped
                    }
                };
                AiUpdate {
                    chunk_id,
                    text,
                    visual_summary: payload.visual_summary,
                    entities: payload.entities,
                }
            }
            Err(e) => {
                tracing::warn!(chunk_id = %chunk_id, error = %e, "Chunk enrichment failed");
                AiUpdate {
                    chunk_id,
                    text: chunk.text.clone(),
                    visual_summary: String::new(),
                    entities: Vec::new(),
                }
            }
        }
    }

    async fn call_generator(&self, chunk: &EnrichedChunk) -> anyhow::Result<EnrichmentPayload> {
        let mut parts = vec![ContentPart::Text(build_enrichment_prompt(chunk))];
        for url in &chunk.images_urls {
            if url.starts_with("http") {
                parts.push(ContentPart::ImageUrl(url.clone()));
            }
        }

        let request = GenerationRequest {
            system: None,
            parts,
            temperature: 0.0,
            max_tokens: ENRICHMENT_MAX_TOKENS,
            json_mode: true,
        };

        let raw = self.generator.generate(request).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn build_enrichment_prompt(chunk: &EnrichedChunk) -> String {
    let mut prompt = format!(
        r#"You are an expert in structured data extraction for a knowledge graph.

CHUNK CONTEXT: {heading}
TEXT CONTENT:
{text}

YOUR TASK:
Answer ONLY with a JSON object containing two keys:

1. "visual_summary":
   - Analyze the TABLES and IMAGES provided.
   - Extract only the factual information that is NOT already in the text.
   - Format: a list of raw facts separated by line breaks.
   - If nothing new: return "".

2. "entities":
   - Extract the entities (people, places, key concepts, events).
   - For each entity provide:
     - "name": canonical name (the most complete form).
     - "type": category (PERSON, PLACE, CONCEPT, EVENT).
     - "aliases": list of variants found or known (e.g. ["Wudu", "Ablutions"]).
     - "relevance": score from 0.0 to 1.0 (importance of the entity in this chunk).

RULES:
- No introductory sentences.
- If this table continues a previous one (is_continuation: {is_continuation}, is_cut: {is_cut}), keep the rows coherent.
- STRICT JSON ONLY."#,
        heading = if chunk.heading_full.is_empty() {
            "Untitled"
        } else {
            &chunk.heading_full
        },
        text = chunk.text,
        is_continuation = chunk.is_table_continuation,
        is_cut = chunk.is_table_cut,
    );

    if !chunk.tables.is_empty() {
        prompt.push_str("\n\n--- TABLES ---\n");
        for (i, table) in chunk.tables.iter().enumerate() {
            prompt.push_str(&format!("Table {}: {}\n", i + 1, table));
        }
    }

    prompt
}

fn table_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\|.*\|\s*$").expect("table line regex"))
}

fn blank_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("blank run regex"))
}

/// Once a visual summary captured the table facts, standalone markdown
/// table rows in the body are noise: drop them and collapse the leftover
/// blank lines.
pub fn strip_table_noise(text: &str) -> String {
    let without_tables = table_line_regex().replace_all(text, "");
    blank_run_regex()
        .replace_all(&without_tables, "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedGenerator {
        response: Result<String, String>,
        calls: Mutex<usize>,
    }

    impl ScriptedGenerator {
        fn ok(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                calls: Mutex::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err("503 service unavailable".to_string()),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _request: GenerationRequest) -> Result<String> {
            *self.calls.lock() += 1;
            self.response
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn chunk_with(tables: Vec<String>, images: Vec<String>) -> EnrichedChunk {
        EnrichedChunk {
            chunk_index: 0,
            text: "Body text.\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\nMore text.".to_string(),
            headings: vec!["Rates".to_string()],
            heading_full: "Rates".to_string(),
            page_numbers: vec![1],
            tables,
            images_urls: images,
            is_table_continuation: false,
            is_table_cut: false,
        }
    }

    #[tokio::test]
    async fn plain_chunks_bypass_the_generator() {
        let generator = Arc::new(ScriptedGenerator::ok("{}"));
        let enricher = ChunkEnricher::new(generator.clone());
        let chunk = EnrichedChunk {
            tables: vec![],
            images_urls: vec![],
            ..chunk_with(vec![], vec![])
        };

        let updates = enricher.enrich_all(&[chunk], &[Uuid::new_v4()]).await;
        assert_eq!(generator.call_count(), 0);
        assert_eq!(updates[0].visual_summary, "");
        assert!(updates[0].entities.is_empty());
    }

    #[tokio::test]
    async fn structured_response_is_parsed() {
        let response = r#"{
            "visual_summary": "The table lists five stations.",
            "entities": [
                {"name": "Miqat", "type": "PLACE", "aliases": ["Mīqāt"], "relevance": 0.9}
            ]
        }"#;
        let generator = Arc::new(ScriptedGenerator::ok(response));
        let enricher = ChunkEnricher::new(generator.clone());
        let chunk = chunk_with(vec!["| a | b |".to_string()], vec![]);

        let updates = enricher.enrich_all(&[chunk], &[Uuid::new_v4()]).await;
        assert_eq!(generator.call_count(), 1);
        assert_eq!(updates[0].visual_summary, "The table lists five stations.");
        assert_eq!(updates[0].entities.len(), 1);
        assert_eq!(updates[0].entities[0].name, "Miqat");
        // Table rows were stripped since a visual summary exists.
        assert!(!updates[0].text.contains('|'));
        assert!(updates[0].text.contains("Body text."));
        assert!(updates[0].text.contains("More text."));
    }

    #[tokio::test]
    async fn generator_failure_degrades_gracefully() {
        let generator = Arc::new(ScriptedGenerator::failing());
        let enricher = ChunkEnricher::new(generator.clone());
        let chunk = chunk_with(vec!["| a | b |".to_string()], vec![]);
        let original_text = chunk.text.clone();

        let updates = enricher.enrich_all(&[chunk], &[Uuid::new_v4()]).await;
        assert_eq!(updates[0].visual_summary, "");
        assert!(updates[0].entities.is_empty());
        assert_eq!(updates[0].text, original_text);
    }

    #[tokio::test]
    async fn empty_summary_keeps_text_verbatim() {
        let generator = Arc::new(ScriptedGenerator::ok(r#"{"visual_summary": "", "entities": []}"#));
        let enricher = ChunkEnricher::new(generator);
        let chunk = chunk_with(vec!["| a | b |".to_string()], vec![]);
        let original_text = chunk.text.clone();

        let updates = enricher.enrich_all(&[chunk], &[Uuid::new_v4()]).await;
        assert_eq!(updates[0].text, original_text);
    }

    #[tokio::test]
    async fn pure_table_chunks_keep_their_body() {
        let generator = Arc::new(ScriptedGenerator::ok(
            r#"{"visual_summary": "Facts.", "entities": []}"#,
        ));
        let enricher = ChunkEnricher::new(generator);
        let mut chunk = chunk_with(vec![], vec![]);
        chunk.text = "| a | b |\n|---|---|\n| 1 | 2 |".to_string();
        chunk.tables = vec![chunk.text.clone()];
        let original_text = chunk.text.clone();

        let updates = enricher.enrich_all(&[chunk], &[Uuid::new_v4()]).await;
        // Stripping would empty the chunk entirely; the body stays.
        assert_eq!(updates[0].text, original_text);
    }

    #[test]
    fn table_noise_stripping_keeps_prose() {
        let cleaned = strip_table_noise("Intro.\n\n| h1 | h2 |\n|----|----|\n| a | b |\n\nOutro.");
        assert_eq!(cleaned, "Intro.\n\nOutro.");
    }

    #[test]
    fn entity_defaults_apply_on_sparse_json() {
        let payload: EnrichmentPayload =
            serde_json::from_str(r#"{"entities": [{"name": "Zamzam"}]}"#).unwrap();
        assert_eq!(payload.entities[0].entity_type, "CONCEPT");
        assert_eq!(payload.entities[0].relevance, 1.0);
        assert!(payload.entities[0].aliases.is_empty());
    }
}
