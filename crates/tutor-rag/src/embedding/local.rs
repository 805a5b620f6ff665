use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Embedder, QUERY_INSTRUCTION};

const MAX_LENGTH: usize = 512;
const MAX_BATCH_SIZE: usize = 8;
const CACHE_SIZE: usize = 1000;

/// Local ONNX sentence encoder with mean pooling and L2 normalization.
/// Inference is synchronous; the `Embedder` impl moves it onto the
/// blocking pool so the orchestration loop never stalls.
pub struct LocalEmbedder {
    inner: Arc<OnnxEncoder>,
}

struct OnnxEncoder {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    dimension: usize,
    cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl LocalEmbedder {
    pub fn load(model_dir: &Path, dimension: usize) -> Result<Self> {
        let model_path = find_model(model_dir)?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(anyhow!(
                "Tokenizer not found at: {}",
                tokenizer_path.display()
            ));
        }

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {:?}", e))?;

        let model_bytes = std::fs::read(&model_path)?;
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Optimization level: {:?}", e))?
            .with_intra_threads(num_threads)
            .map_err(|e| anyhow!("Intra threads: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load embedding model: {:?}", e))?;

        tracing::info!(model = %model_path.display(), dimension, "Local embedder loaded");

        Ok(Self {
            inner: Arc::new(OnnxEncoder {
                session: Mutex::new(session),
                tokenizer,
                dimension,
                cache: RwLock::new(LruCache::new(
                    std::num::NonZeroUsize::new(CACHE_SIZE).expect("nonzero cache size"),
                )),
            }),
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
        "No embedding model found in: {}",
        model_dir.display()
    ))
}

impl OnnxEncoder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            all.extend(self.run_batch(batch)?);
        }
        Ok(all)
    }

    fn run_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut encodings = Vec::with_capacity(batch.len());
        let mut max_len = 0usize;

        for text in batch {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| anyhow!("Tokenization failed: {:?}", e))?;
            let len = encoding.get_ids().len().min(MAX_LENGTH);
            max_len = max_len.max(len);
            encodings.push(encoding);
        }
        let max_len = max_len.max(1);
        let batch_size = encodings.len();

        let mut ids_flat = Vec::with_capacity(batch_size * max_len);
        let mut mask_flat = Vec::with_capacity(batch_size * max_len);

        for encoding in &encodings {
            let len = encoding.get_ids().len().min(max_len);
            for i in 0..len {
                ids_flat.push(encoding.get_ids()[i] as i64);
                mask_flat.push(encoding.get_attention_mask()[i] as i64);
            }
            for _ in len..max_len {
                ids_flat.push(0i64);
                mask_flat.push(0i64);
            }
        }

        let shape = vec![batch_size, max_len];
        let input_ids = Value::from_array((shape.clone(), ids_flat))
            .map_err(|e| anyhow!("input_ids tensor: {:?}", e))?;
        let attention_mask = Value::from_array((shape, mask_flat.clone()))
            .map_err(|e| anyhow!("attention_mask tensor: {:?}", e))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("Embedding inference failed: {:?}", e))?;

        let (out_shape, data) = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to extract hidden state: {:?}", e))?;

        let seq_len = out_shape[1] as usize;
        let hidden_dim = out_shape[2] as usize;

        let mut embeddings = Vec::with_capacity(batch_size);
        for sample in 0..batch_size {
            let mask_offset = sample * max_len;
            let sample_offset = sample * seq_len * hidden_dim;
            let mut pooled = vec![0.0f32; hidden_dim];
            let mut mask_sum = 0.0f32;

            for pos in 0..seq_len {
                let mask_val = if mask_offset + pos < mask_flat.len() {
                    mask_flat[mask_offset + pos] as f32
                } else {
                    0.0
                };
                if mask_val > 0.0 {
                    mask_sum += mask_val;
                    let offset = sample_offset + pos * hidden_dim;
                    for dim in 0..hidden_dim {
                        pooled[dim] += data[offset + dim] * mask_val;
                    }
                }
            }

            if mask_sum > 0.0 {
                for value in &mut pooled {
                    *value /= mask_sum;
                }
            }
            embeddings.push(normalize(pooled));
        }

        Ok(embeddings)
    }

    fn embed_one_cached(&self, text: &str) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let key = format!("{:x}", hasher.finish());

        if let Some(cached) = self.cache.write().get(&key) {
            return Ok(cached.clone());
        }

        let embedding = self
            .embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("Empty embedding batch result"))?;
        self.cache.write().put(key, embedding.clone());
        Ok(embedding)
    }
}

fn normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inner = self.inner.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || inner.embed_batch(&texts)).await?
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let inner = self.inner.clone();
        let prefixed = format!("{QUERY_INSTRUCTION}{text}");
        tokio::task::spawn_blocking(move || inner.embed_one_cached(&prefixed)).await?
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let v = normalize(vec![0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn missing_model_reports_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_model(dir.path()).unwrap_err();
        assert!(err.to_string().contains("No embedding model"));
    }
}
