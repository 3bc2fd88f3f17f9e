use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::settings::LlmSettings;

/// Prompt-in, text-out completion capability.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// Talks to an Ollama server through `/api/generate`.
pub struct OllamaClient {
    client: Client,
    url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: settings.url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl TextCompletion for OllamaClient {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String> {
        debug!(model = %self.model, prompt_len = prompt.len(), "Sending completion request");

        let resp = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": temperature,
                    "num_predict": max_tokens,
                },
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Ollama returned {status}: {body}");
        }

        let body: GenerateResponse = resp.json().await?;
        body.response
            .context("Ollama response did not contain a `response` field")
    }
}
