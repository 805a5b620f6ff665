use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::{Embedder, QUERY_INSTRUCTION};
use crate::config::EmbeddingConfig;

/// Hosted feature-extraction embedder (HuggingFace inference endpoint).
/// Used in production where no local model is shipped.
pub struct HostedEmbedder {
    client: reqwest::Client,
    api_url: String,
    token: String,
    dimension: usize,
}

impl HostedEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.hosted_token.is_empty() {
            tracing::warn!("Hosted embedder token is not set; requests will fail");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            api_url: config.hosted_url.clone(),
            token: config.hosted_token.clone(),
            dimension: config.dimension,
        })
    }

    async fn request(&self, inputs: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&json!({
                "inputs": inputs,
                "options": {"wait_for_model": true},
            }))
            .send()
            .await
            .context("Embedding request failed")?
            .error_for_status()
            .context("Embedding endpoint returned an error status")?;

        response
            .json()
            .await
            .context("Embedding response was not JSON")
    }
}

/// The endpoint returns a bare vector for a single input and a list of
/// vectors for multiple inputs; normalize to a list either way.
fn parse_vectors(value: serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let outer = value
        .as_array()
        .ok_or_else(|| anyhow!("Unexpected embedding payload shape"))?;

    if outer.is_empty() {
        return Ok(Vec::new());
    }

    if outer[0].is_array() {
        outer
            .iter()
            .map(|row| {
                row.as_array()
                    .ok_or_else(|| anyhow!("Ragged embedding payload"))?
                    .iter()
                    .map(|v| {
                        v.as_f64()
                            .map(|f| f as f32)
                            .ok_or_else(|| anyhow!("Non-numeric embedding value"))
                    })
                    .collect()
            })
            .collect()
    } else {
        let vector: Result<Vec<f32>> = outer
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| anyhow!("Non-numeric embedding value"))
            })
            .collect();
        Ok(vec![vector?])
    }
}

#[async_trait]
impl Embedder for HostedEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let value = self.request(json!(texts)).await?;
        let vectors = parse_vectors(value)?;
        if vectors.len() != texts.len() {
            return Err(anyhow!(
                "Embedding count mismatch: sent {}, got {}",
                texts.len(),
                vectors.len()
            ));
        }
        Ok(vectors)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let prefixed = format!("{QUERY_INSTRUCTION}{text}");
        let value = self.request(json!(prefixed)).await?;
        parse_vectors(value)?
            .pop()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_vector_payload_is_wrapped() {
        let vectors = parse_vectors(json!([0.1, 0.2, 0.3])).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 3);
    }

    #[test]
    fn batch_payload_passes_through() {
        let vectors = parse_vectors(json!([[0.1, 0.2], [0.3, 0.4]])).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn non_numeric_payload_is_rejected() {
        assert!(parse_vectors(json!(["a", "b"])).is_err());
        assert!(parse_vectors(json!({"error": "loading"})).is_err());
    }
}
