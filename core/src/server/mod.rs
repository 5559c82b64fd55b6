//! HTTP facade
//!
//! Axum application exposing the chat endpoint, the SSE notification
//! stream, artifact management and health. State construction wires the
//! whole core together from `Settings`.

pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::{HarveyAgent, PricingWorkflow};
use crate::blob::{BlobStore, FsBlobStore};
use crate::bus::NotificationBus;
use crate::clients::analysis::{AnalysisApi, AnalysisClient};
use crate::clients::extractor::ExtractorClient;
use crate::config::{CacheBackend, Settings};
use crate::error::{HarveyError, Result};
use crate::grounding::MatchPolicy;
use crate::llm::client::LlmClient;
use crate::mcp::{McpClient, McpServerConfig, SpecResource};
use crate::pricing::cache::{Extractor, PricingCache};
use crate::pricing::context::CanonicalUrl;
use crate::session::{CancelToken, SessionStore};
use crate::tools::builtin::{register_builtin_tools, register_mcp_tools};
use crate::tools::registry::ToolRegistry;

const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const SESSION_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ANALYSIS_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub cache: Arc<PricingCache>,
    pub bus: NotificationBus,
    pub agent: Arc<HarveyAgent>,
    pub blob: Arc<dyn BlobStore>,
}

/// Placeholder extractor used when `AMINT_BASE_URL` is not configured.
struct DisabledExtractor;

#[async_trait]
impl Extractor for DisabledExtractor {
    async fn transform(&self, _url: &CanonicalUrl) -> Result<String> {
        Err(HarveyError::BadRequest {
            message: "pricing extraction is not configured (set AMINT_BASE_URL)".into(),
        })
    }
}

/// Placeholder analysis API used when `ANALYSIS_BASE_URL` is not configured.
struct DisabledAnalysis;

#[async_trait]
impl AnalysisApi for DisabledAnalysis {
    async fn summary(&self, _yaml: &str, _cancel: &CancelToken) -> Result<serde_json::Value> {
        Err(HarveyError::BadRequest {
            message: "pricing analysis is not configured (set ANALYSIS_BASE_URL)".into(),
        })
    }

    async fn submit(
        &self,
        _yaml: &str,
        _operation: &str,
        _solver: &str,
        _filters: Option<&crate::grounding::FilterCriteria>,
        _objective: Option<&str>,
        _cancel: &CancelToken,
    ) -> Result<String> {
        Err(HarveyError::BadRequest {
            message: "pricing analysis is not configured (set ANALYSIS_BASE_URL)".into(),
        })
    }

    async fn status(
        &self,
        _job_id: &str,
        _cancel: &CancelToken,
    ) -> Result<crate::clients::analysis::AnalysisJob> {
        Err(HarveyError::BadRequest {
            message: "pricing analysis is not configured (set ANALYSIS_BASE_URL)".into(),
        })
    }
}

/// Build the full application state from settings.
pub async fn build_state(settings: &Settings) -> Result<AppState> {
    if settings.cache_backend == CacheBackend::Redis {
        warn!("CACHE_BACKEND=redis is not supported yet; using the in-memory store");
    }

    let bus = NotificationBus::new();

    let extractor: Arc<dyn Extractor> = match &settings.amint_base_url {
        Some(base_url) => Arc::new(ExtractorClient::new(
            base_url.clone(),
            settings.cache.transform_timeout,
        )?),
        None => {
            warn!("AMINT_BASE_URL not set; URL transformation disabled");
            Arc::new(DisabledExtractor)
        }
    };
    let cache = PricingCache::new(extractor, bus.clone(), settings.cache);

    let analysis: Arc<dyn AnalysisApi> = match &settings.analysis_base_url {
        Some(base_url) => Arc::new(AnalysisClient::new(base_url.clone(), ANALYSIS_REQUEST_TIMEOUT)?),
        None => {
            warn!("ANALYSIS_BASE_URL not set; solver tooling disabled");
            Arc::new(DisabledAnalysis)
        }
    };

    let workflow = PricingWorkflow::new(
        cache.clone(),
        analysis,
        MatchPolicy::default(),
        settings.analysis_poll_cap,
    );

    let mcp_client = settings.mcp.command.as_ref().map(|command| {
        McpClient::new(McpServerConfig {
            command: command.clone(),
            args: settings.mcp.args.clone(),
            extra_path: settings.mcp.extra_path.clone(),
        })
    });
    let spec = mcp_client
        .as_ref()
        .map(|client| Arc::new(SpecResource::new(client.clone())));

    let mut registry = ToolRegistry::new();
    match (&mcp_client, settings.mcp.tools_via_mcp) {
        (Some(client), true) => {
            info!("tool calls routed through the MCP server");
            register_mcp_tools(&mut registry, client.clone())?;
        }
        _ => register_builtin_tools(&mut registry, workflow)?,
    }

    let llm = Arc::new(LlmClient::new(settings.llm.clone())?);
    let agent = Arc::new(HarveyAgent::new(
        llm,
        Arc::new(registry),
        settings.agent,
        spec,
    ));

    let blob: Arc<dyn BlobStore> =
        Arc::new(FsBlobStore::new(settings.blob_dir.clone()).await?);

    Ok(AppState {
        sessions: Arc::new(SessionStore::new(SESSION_IDLE_TTL)),
        cache,
        bus,
        agent,
        blob,
    })
}

/// Assemble the router over the shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/chat", post(routes::chat))
        .route("/events", get(routes::events))
        .route("/upload", post(routes::upload))
        .route("/pricing/{id}", delete(routes::delete_pricing))
        .route("/static/{id}", get(routes::get_static))
        .route("/sessions/{id}/cancel", post(routes::cancel_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(settings: &Settings, state: AppState) -> Result<()> {
    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| HarveyError::BindError {
            addr: addr.clone(),
            message: e.to_string(),
        })?;
    info!(addr = %addr, "harvey listening");

    tokio::spawn(routes::run_session_gc(state.clone(), SESSION_GC_INTERVAL));

    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| HarveyError::internal(format!("server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn state_builds_without_upstreams_configured() {
        let mut vars = HashMap::new();
        vars.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
        vars.insert(
            "BLOB_DIR".to_string(),
            tempfile::tempdir()
                .unwrap()
                .path()
                .to_string_lossy()
                .to_string(),
        );
        let settings = Settings::from_map(&vars).unwrap();
        let state = build_state(&settings).await.unwrap();
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn disabled_adapters_reject_with_configuration_hints() {
        let err = DisabledExtractor
            .transform(&CanonicalUrl::parse("https://example.com/pricing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HarveyError::BadRequest { message } if message.contains("AMINT_BASE_URL")));

        let err = DisabledAnalysis
            .summary("saasName: X", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarveyError::BadRequest { message } if message.contains("ANALYSIS_BASE_URL")));
    }
}
