//! A-MINT extractor adapter
//!
//! Turns a pricing page URL into a Pricing2Yaml document. A transformation
//! can take minutes, so the HTTP timeout here is the per-transformation
//! budget, not the usual request timeout. This client is only ever invoked
//! from the cache's single-flight path.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::retry::{retry_request, RetryConfig};
use crate::error::{HarveyError, Result};
use crate::pricing::cache::Extractor;
use crate::pricing::context::CanonicalUrl;
use crate::session::CancelToken;

const SERVICE: &str = "amint";
const DEFAULT_MODEL: &str = "gpt-5.2";
const DEFAULT_MAX_TRIES: u32 = 50;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// HTTP client for the extractor service
pub struct ExtractorClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_tries: u32,
    temperature: f32,
    retry: RetryConfig,
}

impl ExtractorClient {
    pub fn new(base_url: impl Into<String>, transform_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(transform_timeout)
            .build()
            .map_err(|e| HarveyError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tries: DEFAULT_MAX_TRIES,
            temperature: DEFAULT_TEMPERATURE,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Extractor for ExtractorClient {
    async fn transform(&self, url: &CanonicalUrl) -> Result<String> {
        let endpoint = format!("{}/api/v1/transform", self.base_url);
        let body = json!({
            "url": url.as_str(),
            "model": self.model,
            "max_tries": self.max_tries,
            "temperature": self.temperature,
        });
        info!(url = %url, "requesting pricing transformation");

        // The cache's flight is detached from any one waiter, so there is
        // no caller token to honour here.
        let cancel = CancelToken::new();
        retry_request(&self.retry, &cancel, SERVICE, || {
            let http = self.http.clone();
            let endpoint = endpoint.clone();
            let body = body.clone();
            let url = url.clone();
            async move {
                let response = http.post(&endpoint).json(&body).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(HarveyError::HttpStatus {
                        status: status.as_u16(),
                        message,
                    });
                }
                let yaml = response.text().await.map_err(HarveyError::from)?;
                if yaml.trim().is_empty() {
                    return Err(HarveyError::internal(format!(
                        "extractor returned an empty document for {url}"
                    )));
                }
                Ok(yaml)
            }
        })
        .await
    }
}
