//! Core library for Harvey, the pricing intelligence agent.
//!
//! Harvey answers natural-language SaaS pricing questions by running a
//! bounded ReAct loop over an LLM whose tools are backed by the pricing
//! analysis service, the A-MINT extractor, and a single-flight
//! transformation cache grounded in Pricing2Yaml documents.
//!
//! # Main Modules
//! - `agent`: the ReAct loop, prompt assembly and the pricing workflow
//! - `tools`: schema-validated tool registry and the built-in tool set
//! - `pricing`: catalog parsing, context items and the transformation cache
//! - `clients`: analysis and extractor adapters with shared retry policy
//! - `mcp`: JSON-RPC 2.0 stdio host for the pricing MCP server
//! - `bus`: session-scoped notification bus behind the SSE endpoint
//! - `server`: the axum HTTP facade
//! - `session`: conversation, step history and cancellation state

pub mod agent;
pub mod blob;
pub mod bus;
pub mod clients;
pub mod config;
pub mod error;
pub mod grounding;
pub mod llm;
pub mod mcp;
pub mod pricing;
pub mod server;
pub mod session;
pub mod tools;

// Re-exports for convenience
pub use agent::{HarveyAgent, TurnOutcome};
pub use config::Settings;
pub use error::{HarveyError, Result};
pub use session::{Session, SessionStore};
