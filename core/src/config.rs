//! Service configuration
//!
//! All settings are read from the environment once at startup. Defaults are
//! safe for local development; anything unset that the service genuinely
//! needs (LLM credentials, upstream base URLs) fails fast with a
//! `ConfigError` so the launcher can exit with code 2.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HarveyError, Result};

/// Storage backend for the pricing-context cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    /// Accepted for deployment compatibility; currently served by the
    /// in-memory store (a warning is logged at startup).
    Redis,
}

impl CacheBackend {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "" | "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(HarveyError::ConfigError {
                message: format!("unsupported CACHE_BACKEND '{other}' (expected memory or redis)"),
            }),
        }
    }
}

/// LLM connection settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Rotating credential list; the client advances on 401/429
    pub api_keys: Vec<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
    /// Retries for transport failures talking to the LLM itself
    pub max_retries: u32,
}

/// Agent loop limits
#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    pub step_budget: usize,
    pub step_budget_hard_cap: usize,
    pub step_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            step_budget: 8,
            step_budget_hard_cap: 16,
            step_timeout: Duration::from_secs(90),
            tool_timeout: Duration::from_secs(120),
        }
    }
}

/// Pricing-context cache knobs
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub error_cooldown: Duration,
    pub max_entries: usize,
    pub transform_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            error_cooldown: Duration::from_secs(5 * 60),
            max_entries: 256,
            transform_timeout: Duration::from_secs(900),
        }
    }
}

/// MCP subprocess settings; `None` command disables the MCP path entirely
#[derive(Debug, Clone, Default)]
pub struct McpSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Extra path entries appended to the child's PATH-like search variable
    pub extra_path: Option<String>,
    /// Route tool calls through the MCP server instead of the in-process
    /// workflow (the alternative deployment)
    pub tools_via_mcp: bool,
}

/// Top-level service settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub amint_base_url: Option<String>,
    pub analysis_base_url: Option<String>,
    pub cache_backend: CacheBackend,
    pub http_host: String,
    pub http_port: u16,
    pub log_level: String,
    pub blob_dir: PathBuf,
    pub mcp: McpSettings,
    pub agent: AgentLimits,
    pub cache: CacheSettings,
    pub analysis_poll_cap: Duration,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Read settings from an explicit key/value map.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_keys: Vec<String> = get("OPENAI_API_KEY")
            .map(|raw| {
                raw.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let llm = LlmSettings {
            api_keys,
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-5".to_string()),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            request_timeout: duration_secs(vars, "LLM_TIMEOUT_SECS", 300)?,
            max_retries: 2,
        };

        let mut agent = AgentLimits::default();
        if let Some(raw) = get("AGENT_STEP_BUDGET") {
            let budget = parse_usize("AGENT_STEP_BUDGET", &raw)?;
            agent.step_budget = budget.min(agent.step_budget_hard_cap);
        }
        if let Some(secs) = opt_duration_secs(vars, "AGENT_STEP_TIMEOUT_SECS")? {
            agent.step_timeout = secs;
        }
        if let Some(secs) = opt_duration_secs(vars, "AGENT_TOOL_TIMEOUT_SECS")? {
            agent.tool_timeout = secs;
        }

        let mut cache = CacheSettings::default();
        if let Some(secs) = opt_duration_secs(vars, "CACHE_TTL_SECS")? {
            cache.ttl = secs;
        }
        if let Some(secs) = opt_duration_secs(vars, "CACHE_COOLDOWN_SECS")? {
            cache.error_cooldown = secs;
        }
        if let Some(raw) = get("CACHE_MAX_ENTRIES") {
            cache.max_entries = parse_usize("CACHE_MAX_ENTRIES", &raw)?.max(1);
        }
        if let Some(secs) = opt_duration_secs(vars, "TRANSFORM_TIMEOUT_SECS")? {
            cache.transform_timeout = secs;
        }

        let mcp = McpSettings {
            command: get("MCP_COMMAND"),
            args: get("MCP_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            extra_path: get("MCP_EXTRA_PATH"),
            tools_via_mcp: get("MCP_TOOLS").map(|v| v == "1" || v == "true").unwrap_or(false),
        };

        let http_port = match get("HTTP_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| HarveyError::ConfigError {
                message: format!("HTTP_PORT must be a port number, got '{raw}'"),
            })?,
            None => 8004,
        };

        Ok(Self {
            llm,
            amint_base_url: get("AMINT_BASE_URL").map(strip_trailing_slash),
            analysis_base_url: get("ANALYSIS_BASE_URL").map(strip_trailing_slash),
            cache_backend: CacheBackend::parse(&get("CACHE_BACKEND").unwrap_or_default())?,
            http_host: get("HTTP_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            http_port,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            blob_dir: get("BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("blob_store")),
            mcp,
            agent,
            cache,
            analysis_poll_cap: duration_secs(vars, "ANALYSIS_POLL_CAP_SECS", 120)?,
        })
    }

    /// Validate the settings that the serve path cannot run without.
    pub fn validate_for_serve(&self) -> Result<()> {
        if self.llm.api_keys.is_empty() {
            return Err(HarveyError::ConfigError {
                message: "OPENAI_API_KEY is required for natural language orchestration".into(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

fn strip_trailing_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.parse::<usize>().map_err(|_| HarveyError::ConfigError {
        message: format!("{key} must be a non-negative integer, got '{raw}'"),
    })
}

fn duration_secs(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration> {
    Ok(opt_duration_secs(vars, key)?.unwrap_or(Duration::from_secs(default)))
}

fn opt_duration_secs(vars: &HashMap<String, String>, key: &str) -> Result<Option<Duration>> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => {
            let secs = raw.parse::<u64>().map_err(|_| HarveyError::ConfigError {
                message: format!("{key} must be an integer number of seconds, got '{raw}'"),
            })?;
            Ok(Some(Duration::from_secs(secs)))
        }
        None => Ok(None),
    }
}
