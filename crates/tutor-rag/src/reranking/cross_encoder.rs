use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Reranker;

const MAX_LENGTH: usize = 512;
const MAX_BATCH: usize = 16;

/// Local ONNX cross-encoder. Scores every (query, passage) pair in
/// batches; inference runs on the blocking pool.
pub struct CrossEncoderReranker {
    inner: Arc<CrossEncoderCore>,
}

struct CrossEncoderCore {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
}

impl CrossEncoderReranker {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let model_path = find_model(model_dir)?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(anyhow!(
                "Reranker tokenizer not found at: {}",
                tokenizer_path.display()
            ));
        }

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load reranker tokenizer: {:?}", e))?;

        let model_bytes = std::fs::read(&model_path)?;
        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Optimization level: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load reranker model: {:?}", e))?;

        tracing::info!(model = %model_path.display(), "Cross-encoder reranker loaded");

        Ok(Self {
            inner: Arc::new(CrossEncoderCore { session: Mutex::new(session), tokenizer }),
        })
    }
}

fn find_model(model_dir: &Path) -> Result<PathBuf> {
    let candidates = [
        model_dir.join("model_O4.onnx"),
        model_dir.join("model.onnx"),
    ];
    for path in &candidates {
        if path.exists() {
            return Ok(path.clone());
        }
    }
    Err(anyhow!(
        "No reranker model found in: {}",
        model_dir.display()
    ))
}

impl CrossEncoderCore {
    /// Score all passages against the query, index-aligned with the input.
    /// Passages the tokenizer rejects score `f32::NEG_INFINITY` so they
    /// sort last and fall under any cutoff.
    fn score_all(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut scores = vec![f32::NEG_INFINITY; passages.len()];

        for batch_start in (0..passages.len()).step_by(MAX_BATCH) {
            let batch_end = (batch_start + MAX_BATCH).min(passages.len());

            let mut indices = Vec::new();
            let mut encodings = Vec::new();
            for idx in batch_start..batch_end {
                if let Ok(encoding) = self
                    .tokenizer
                    .encode((query, passages[idx].as_str()), true)
                {
                    indices.push(idx);
                    encodings.push(encoding);
                }
            }
            if encodings.is_empty() {
                continue;
            }

            let max_len = encodings
                .iter()
                .map(|e| e.get_ids().len().min(MAX_LENGTH))
                .max()
                .unwrap_or(1);
            let batch_size = encodings.len();

            let mut ids_flat = Vec::with_capacity(batch_size * max_len);
            let mut mask_flat = Vec::with_capacity(batch_size * max_len);
            let mut type_flat = Vec::with_capacity(batch_size * max_len);

            for encoding in &encodings {
                let len = encoding.get_ids().len().min(max_len);
                for i in 0..len {
                    ids_flat.push(encoding.get_ids()[i] as i64);
                    mask_flat.push(encoding.get_attention_mask()[i] as i64);
                    type_flat.push(encoding.get_type_ids()[i] as i64);
                }
                for _ in len..max_len {
                    ids_flat.push(0i64);
                    mask_flat.push(0i64);
                    type_flat.push(0i64);
                }
            }

            let shape = vec![batch_size, max_len];
            let input_ids = Value::from_array((shape.clone(), ids_flat))
                .map_err(|e| anyhow!("input_ids tensor: {:?}", e))?;
            let attention_mask = Value::from_array((shape.clone(), mask_flat))
                .map_err(|e| anyhow!("attention_mask tensor: {:?}", e))?;
            let token_type_ids = Value::from_array((shape, type_flat))
                .map_err(|e| anyhow!("token_type_ids tensor: {:?}", e))?;

            let inputs = ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ];

            let mut session = self.session.lock();
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow!("Reranker inference failed: {:?}", e))?;

            let output_key = outputs
                .iter()
                .next()
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| "logits".to_string());
            let (_shape, data) = outputs[output_key.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("Failed to extract logits: {:?}", e))?;

            for (slot, &idx) in indices.iter().enumerate() {
                if slot < data.len() {
                    scores[idx] = data[slot];
                }
            }
        }

        Ok(scores)
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_n: usize,
    ) -> Result<Vec<(usize, f32)>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.clone();
        let query = query.to_string();
        let passages = passages.to_vec();
        let scores =
            tokio::task::spawn_blocking(move || inner.score_all(&query, &passages)).await??;

        let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_n);
        Ok(ranked)
    }
}
