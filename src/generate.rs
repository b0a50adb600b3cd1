//! Generative model collaborator.
//!
//! [`Generator`] is the `prompt, max_tokens -> completion` contract used by
//! the question-answering session. [`LlamaServerGenerator`] talks to a
//! llama.cpp server (`llama-server`) over HTTP using its native
//! `/completion` endpoint; sampling settings and stop sequences come from
//! `[generation]` in the config.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::embedding::send_with_retry;
use crate::error::{DocletError, Result};

/// Rough characters-per-token ratio used to pre-check prompt size.
const CHARS_PER_TOKEN: usize = 4;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Complete `prompt`, producing at most `max_tokens` tokens.
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String>;
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Client for a running llama.cpp server.
pub struct LlamaServerGenerator {
    url: String,
    temperature: f32,
    context_window: usize,
    stop: Vec<String>,
    client: reqwest::Client,
}

impl LlamaServerGenerator {
    /// Build a client and verify the server answers its health check.
    ///
    /// An unreachable or unhealthy server is a configuration error: the
    /// model is not available, so nothing that needs it can run.
    pub async fn connect(config: &GenerationConfig) -> Result<Self> {
        let generator = Self::new(config)?;
        let health = format!("{}/health", generator.url);
        let response = generator
            .client
            .get(&health)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                DocletError::Config(format!(
                    "generative model server not reachable at {}: {}",
                    generator.url, e
                ))
            })?;
        if !response.status().is_success() {
            return Err(DocletError::Config(format!(
                "generative model server at {} is not ready (HTTP {})",
                generator.url,
                response.status()
            )));
        }
        tracing::info!(url = %generator.url, "connected to generative model server");
        Ok(generator)
    }

    /// Build a client without contacting the server.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DocletError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            context_window: config.context_window,
            stop: config.stop.clone(),
            client,
        })
    }

    fn check_budget(&self, prompt: &str, max_tokens: usize) -> Result<()> {
        let needed = estimate_tokens(prompt) + max_tokens;
        if needed > self.context_window {
            return Err(DocletError::Generation(format!(
                "prompt needs about {} tokens but the context window is {}",
                needed, self.context_window
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Generator for LlamaServerGenerator {
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        self.check_budget(prompt, max_tokens)?;

        let body = serde_json::json!({
            "prompt": prompt,
            "n_predict": max_tokens,
            "temperature": self.temperature,
            "stop": self.stop,
            "cache_prompt": true,
        });
        let request = self
            .client
            .post(format!("{}/completion", self.url))
            .header("Content-Type", "application/json")
            .json(&body);

        let started = std::time::Instant::now();
        let json = send_with_retry(request, 0, "llama-server")
            .await
            .map_err(|e| DocletError::Generation(format!("{:#}", e)))?;
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "completion received");

        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            DocletError::Generation("invalid llama-server response: missing content".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn oversized_prompt_is_a_generation_error() {
        let generator = LlamaServerGenerator::new(&GenerationConfig::default()).unwrap();
        let prompt = "x".repeat(4 * 2000);
        let err = generator.check_budget(&prompt, 200).unwrap_err();
        assert!(matches!(err, DocletError::Generation(_)));
        assert!(generator.check_budget("short prompt", 200).is_ok());
    }

    #[test]
    fn parses_completion_content() {
        let json = serde_json::json!({"content": " The answer.", "stop": true});
        assert_eq!(parse_completion(&json).unwrap(), " The answer.");
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_config_error() {
        let config = GenerationConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..GenerationConfig::default()
        };
        let err = LlamaServerGenerator::connect(&config).await.err().unwrap();
        assert!(matches!(err, DocletError::Config(_)));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = GenerationConfig {
            url: "http://localhost:8080/".to_string(),
            ..GenerationConfig::default()
        };
        let generator = LlamaServerGenerator::new(&config).unwrap();
        assert_eq!(generator.url, "http://localhost:8080");
    }
}
