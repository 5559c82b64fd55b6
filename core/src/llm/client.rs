//! LLM client implementation
//!
//! Talks to any OpenAI-compatible chat-completions endpoint. Transport
//! failures are retried a bounded number of times; 401/429 responses rotate
//! to the next configured API key before giving up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use tracing::{debug, warn};

use super::chat::{ChatRequest, ChatResponse};
use crate::config::LlmSettings;
use crate::error::{HarveyError, Result};

/// Seam the agent loop depends on; implemented by [`LlmClient`] in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Model identifier advertised to callers building requests
    fn model(&self) -> &str;
}

/// OpenAI-compatible chat client
pub struct LlmClient {
    settings: LlmSettings,
    http: HttpClient,
    /// Index into the rotating key list
    key_cursor: AtomicUsize,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        if settings.api_keys.is_empty() {
            return Err(HarveyError::ConfigError {
                message: "at least one LLM API key is required".into(),
            });
        }
        let http = HttpClient::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| HarveyError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(LlmClient {
            settings,
            http,
            key_cursor: AtomicUsize::new(0),
        })
    }

    fn current_key(&self) -> &str {
        let idx = self.key_cursor.load(Ordering::Relaxed) % self.settings.api_keys.len();
        &self.settings.api_keys[idx]
    }

    fn rotate_key(&self) {
        if self.settings.api_keys.len() > 1 {
            let next = self.key_cursor.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                key_index = next % self.settings.api_keys.len(),
                "rotating LLM API key"
            );
        }
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.current_key())
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: ChatResponse = response.json().await.map_err(|e| {
                    HarveyError::internal(format!("failed to decode LLM response: {e}"))
                })?;
                Ok(body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS => {
                let status = response.status().as_u16();
                self.rotate_key();
                Err(HarveyError::HttpStatus {
                    status,
                    message: "LLM credential rejected or rate-limited".into(),
                })
            }
            status => {
                let message = extract_error_message(response).await;
                Err(HarveyError::HttpStatus {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl ChatClient for LlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut last_error = None;
        for attempt in 0..=self.settings.max_retries {
            match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    // 401/429 already rotated the key; retry with the next one
                    let rotated = matches!(
                        err,
                        HarveyError::HttpStatus { status: 401 | 429, .. }
                    ) && self.settings.api_keys.len() > 1;
                    if !err.is_retryable() && !rotated {
                        return Err(err);
                    }
                    debug!(attempt, error = %err, "LLM request failed, retrying");
                    if attempt < self.settings.max_retries {
                        let delay = err
                            .retry_delay()
                            .unwrap_or(Duration::from_millis(500))
                            * (attempt + 1);
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| HarveyError::UpstreamUnavailable {
            service: "llm".into(),
        }))
    }

    fn model(&self) -> &str {
        &self.settings.model
    }
}

async fn extract_error_message(response: reqwest::Response) -> String {
    let body: Option<serde_json::Value> = response.json().await.ok();
    body.as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("unknown provider error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(keys: &[&str]) -> LlmSettings {
        LlmSettings {
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            model: "gpt-5".into(),
            base_url: "http://localhost:1".into(),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }

    #[test]
    fn client_requires_a_key() {
        assert!(LlmClient::new(settings(&[])).is_err());
        assert!(LlmClient::new(settings(&["sk-a"])).is_ok());
    }

    #[test]
    fn key_rotation_cycles_through_the_list() {
        let client = LlmClient::new(settings(&["sk-a", "sk-b"])).unwrap();
        assert_eq!(client.current_key(), "sk-a");
        client.rotate_key();
        assert_eq!(client.current_key(), "sk-b");
        client.rotate_key();
        assert_eq!(client.current_key(), "sk-a");
    }

    #[test]
    fn single_key_never_rotates() {
        let client = LlmClient::new(settings(&["sk-only"])).unwrap();
        client.rotate_key();
        assert_eq!(client.current_key(), "sk-only");
    }
}
