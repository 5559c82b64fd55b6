//! MCP host: JSON-RPC protocol types, the stdio client, and the cached
//! Pricing2Yaml specification resource.

pub mod client;
pub mod protocol;

pub use client::{McpClient, McpServerConfig};

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

/// Resource that returns the Pricing2Yaml specification excerpt
pub const SPEC_RESOURCE_URI: &str = "resource://pricing/specification";

/// Lazily fetched, cached specification excerpt.
///
/// The excerpt is immutable for the server's lifetime, so one successful
/// read is kept for the process; failures are retried on the next ask.
pub struct SpecResource {
    client: Arc<McpClient>,
    cached: Mutex<Option<String>>,
}

impl SpecResource {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self {
            client,
            cached: Mutex::new(None),
        }
    }

    /// The specification excerpt, or `None` when the MCP server cannot
    /// provide it. Absence is not fatal; the agent answers without it.
    pub async fn excerpt(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;
        if let Some(text) = cached.as_ref() {
            return Some(text.clone());
        }
        match self.client.read_resource(SPEC_RESOURCE_URI).await {
            Ok(text) if !text.is_empty() => {
                *cached = Some(text.clone());
                Some(text)
            }
            Ok(_) => {
                warn!("specification resource is empty");
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to read specification resource");
                None
            }
        }
    }
}
