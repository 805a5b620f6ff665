//! Generator contract and the OpenAI-compatible chat client behind it.
//! The rest of the crate only sees `Generator`; callers decide how to
//! degrade when a call fails.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::GeneratorConfig;

/// One piece of multimodal user content.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    /// Remote image, attached at low detail to bound token cost.
    ImageUrl(String),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub parts: Vec<ContentPart>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Force a JSON-object response (structured extraction calls).
    pub json_mode: bool,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            parts: vec![ContentPart::Text(prompt.into())],
            temperature: 0.0,
            max_tokens: 1024,
            json_mode: false,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build generator HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn build_content(parts: &[ContentPart]) -> serde_json::Value {
        let content: Vec<serde_json::Value> = parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({"type": "text", "text": text}),
                ContentPart::ImageUrl(url) => json!({
                    "type": "image_url",
                    "image_url": {"url": url, "detail": "low"},
                }),
            })
            .collect();
        json!(content)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({
            "role": "user",
            "content": Self::build_content(&request.parts),
        }));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Generator request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read generator response body")?;

        if !status.is_success() {
            let preview: String = body.chars().take(300).collect();
            return Err(anyhow!("Generator returned HTTP {}: {}", status, preview));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!("Generator response was not JSON: {} ({})", e, preview)
        })?;

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Generator response carried no content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_parts_render_text_and_low_detail_images() {
        let content = OpenAiGenerator::build_content(&[
            ContentPart::Text("question".into()),
            ContentPart::ImageUrl("http://blobs/img.jpg".into()),
        ]);

        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["detail"], "low");
        assert_eq!(content[1]["image_url"]["url"], "http://blobs/img.jpg");
    }
}
