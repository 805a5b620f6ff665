use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::Reranker;
use crate::config::RerankConfig;

const RERANK_ENDPOINT: &str = "https://api.cohere.ai/v1/rerank";

/// Hosted rerank API used in production deployments.
pub struct HostedReranker {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl HostedReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        if config.hosted_api_key.is_empty() {
            return Err(anyhow!("Hosted reranker API key is not configured"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build rerank HTTP client")?;

        Ok(Self {
            client,
            api_key: config.hosted_api_key.clone(),
            model: config.hosted_model.clone(),
        })
    }
}

#[async_trait]
impl Reranker for HostedReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_n: usize,
    ) -> Result<Vec<(usize, f32)>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(RERANK_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": passages,
                "top_n": top_n,
            }))
            .send()
            .await
            .context("Rerank request failed")?
            .error_for_status()
            .context("Rerank endpoint returned an error status")?;

        let parsed: RerankResponse = response
            .json()
            .await
            .context("Rerank response was not JSON")?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| r.index < passages.len())
            .map(|r| (r.index, r.relevance_score))
            .collect())
    }
}
