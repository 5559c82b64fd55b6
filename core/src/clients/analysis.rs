//! Analysis API adapter
//!
//! Two operations are consumed by the core: the synchronous summary endpoint
//! and the asynchronous analysis-job lifecycle (submit, then poll with
//! exponential backoff until the job settles or the wall-clock cap is hit).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::retry::{retry_request, RetryConfig};
use crate::error::{HarveyError, Result};
use crate::grounding::FilterCriteria;
use crate::session::CancelToken;

const SERVICE: &str = "analysis";
const POLL_BASE: Duration = Duration::from_millis(200);
const POLL_CAP: Duration = Duration::from_secs(5);

/// Remote job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Remote handle for one analysis job, returned verbatim by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Seam to the analysis service
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    /// Synchronous counts/statistics for one pricing document
    async fn summary(&self, yaml: &str, cancel: &CancelToken) -> Result<Value>;

    /// Submit an analysis job, returning its id
    async fn submit(
        &self,
        yaml: &str,
        operation: &str,
        solver: &str,
        filters: Option<&FilterCriteria>,
        objective: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<String>;

    /// Fetch the current job envelope
    async fn status(&self, job_id: &str, cancel: &CancelToken) -> Result<AnalysisJob>;
}

/// Poll a submitted job until it settles.
///
/// Backoff grows `200 ms * 2^k` capped at 5 s; `poll_budget` bounds the
/// total wall clock. A timed-out job is abandoned, not cancelled upstream.
pub async fn await_job(
    api: &dyn AnalysisApi,
    job_id: &str,
    poll_budget: Duration,
    cancel: &CancelToken,
) -> Result<Value> {
    let started = std::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(HarveyError::Cancelled);
        }

        let job = api.status(job_id, cancel).await?;
        match job.status {
            JobStatus::Completed => {
                info!(job_id, "analysis job completed");
                return job.result.ok_or_else(|| HarveyError::internal(
                    format!("completed analysis job {job_id} carried no result"),
                ));
            }
            JobStatus::Failed => {
                let message = job
                    .error
                    .unwrap_or_else(|| "analysis job failed without a message".to_string());
                return Err(HarveyError::SolverError { message });
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        if started.elapsed() >= poll_budget {
            debug!(job_id, "abandoning analysis job after poll budget");
            return Err(HarveyError::Timeout {
                duration: poll_budget,
            });
        }

        let delay = poll_delay(attempt);
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return Err(HarveyError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn poll_delay(attempt: u32) -> Duration {
    let millis = POLL_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    Duration::from_millis(millis).min(POLL_CAP)
}

/// HTTP implementation backed by reqwest
pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarveyError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        })
    }

    fn yaml_part(yaml: &str) -> Result<Part> {
        Part::text(yaml.to_string())
            .file_name("pricing.yaml")
            .mime_str("application/yaml")
            .map_err(|e| HarveyError::internal(format!("invalid multipart mime: {e}")))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(HarveyError::HttpStatus {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl AnalysisApi for AnalysisClient {
    async fn summary(&self, yaml: &str, cancel: &CancelToken) -> Result<Value> {
        let url = format!("{}/pricing/summary", self.base_url);
        retry_request(&self.retry, cancel, SERVICE, || {
            let http = self.http.clone();
            let url = url.clone();
            let yaml = yaml.to_string();
            async move {
                let form = Form::new().part("file", Self::yaml_part(&yaml)?);
                let response = http.post(&url).multipart(form).send().await?;
                let response = Self::check(response).await?;
                let body = response
                    .json::<Value>()
                    .await
                    .map_err(|e| HarveyError::internal(format!("summary response not JSON: {e}")))?;
                Ok(body)
            }
        })
        .await
    }

    async fn submit(
        &self,
        yaml: &str,
        operation: &str,
        solver: &str,
        filters: Option<&FilterCriteria>,
        objective: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<String> {
        let url = format!("{}/pricing/analysis", self.base_url);
        let filters_json = match filters {
            Some(f) if !f.is_empty() => Some(serde_json::to_string(f)?),
            _ => None,
        };

        retry_request(&self.retry, cancel, SERVICE, || {
            let http = self.http.clone();
            let url = url.clone();
            let yaml = yaml.to_string();
            let operation = operation.to_string();
            let solver = solver.to_string();
            let filters_json = filters_json.clone();
            let objective = objective.map(str::to_string);
            async move {
                let mut form = Form::new()
                    .part("file", Self::yaml_part(&yaml)?)
                    .text("operation", operation.clone())
                    .text("solver", solver);
                if let Some(filters) = filters_json {
                    form = form.text("filters", filters);
                }
                if let Some(objective) = objective {
                    form = form.text("objective", objective);
                }

                let response = http.post(&url).multipart(form).send().await?;
                let response = Self::check(response).await?;
                let job: AnalysisJob = response
                    .json()
                    .await
                    .map_err(|e| HarveyError::internal(format!("job envelope not JSON: {e}")))?;
                info!(job_id = %job.job_id, %operation, "analysis job submitted");
                Ok(job.job_id)
            }
        })
        .await
    }

    async fn status(&self, job_id: &str, cancel: &CancelToken) -> Result<AnalysisJob> {
        let url = format!("{}/pricing/analysis/{job_id}", self.base_url);
        retry_request(&self.retry, cancel, SERVICE, || {
            let http = self.http.clone();
            let url = url.clone();
            async move {
                let response = http.get(&url).send().await?;
                let response = Self::check(response).await?;
                response
                    .json::<AnalysisJob>()
                    .await
                    .map_err(|e| HarveyError::internal(format!("job envelope not JSON: {e}")))
            }
        })
        .await
    }
}
