//! Tool registry
//!
//! Tools register once at startup and the catalogue is immutable afterwards;
//! `list()` preserves registration order so the LLM always sees a stable
//! schema. `invoke` enforces the declared input schema before any
//! implementation runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::schema::{canonicalize, ToolDescriptor};
use crate::error::{HarveyError, Result};
use crate::llm::chat::ChatTool;
use crate::session::CancelToken;

/// Per-invocation context handed to tool implementations
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Uuid,
    pub cancel: CancelToken,
    /// Uploaded YAML aliases (`uploaded://pricing[/n]` → content)
    pub aliases: HashMap<String, String>,
    /// Canonical URL → context item id, for cache notifications
    pub url_items: HashMap<String, Uuid>,
    /// Reference used when a call omits `pricing_url` and exactly one
    /// pricing context exists
    pub default_reference: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: Uuid, cancel: CancelToken) -> Self {
        Self {
            session_id,
            cancel,
            aliases: HashMap::new(),
            url_items: HashMap::new(),
            default_reference: None,
        }
    }
}

/// A tool the agent can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Execute with already-validated arguments.
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Order-stable tool catalogue
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; duplicate names are a startup error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.descriptor().name.clone();
        if self.index.contains_key(&name) {
            return Err(HarveyError::internal(format!(
                "tool '{name}' registered twice"
            )));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Descriptors in registration order.
    pub fn list(&self) -> Vec<&ToolDescriptor> {
        self.tools.iter().map(|tool| tool.descriptor()).collect()
    }

    /// Catalogue rendered for the LLM.
    pub fn chat_tools(&self) -> Vec<ChatTool> {
        self.tools
            .iter()
            .map(|tool| tool.descriptor().to_chat_tool())
            .collect()
    }

    /// Validate arguments against the tool's schema, then dispatch.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
        let tool = self
            .index
            .get(name)
            .and_then(|&i| self.tools.get(i))
            .ok_or_else(|| HarveyError::ToolNotFound {
                name: name.to_string(),
            })?;

        tool.descriptor().input.validate(&args, "$")?;

        let canonical = canonicalize(&args);
        debug!(tool = name, args = %canonical, "invoking tool");
        tool.call(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ObjectSchema, ParamSpec, SideEffect};
    use serde_json::json;

    struct EchoTool {
        descriptor: ToolDescriptor,
    }

    impl EchoTool {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ToolDescriptor {
                    name: name.to_string(),
                    description: "echo".into(),
                    input: ObjectSchema::new()
                        .field("text", ParamSpec::string("what to echo")),
                    output_description: "the input".into(),
                    side_effect: SideEffect::Pure,
                },
            })
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({"echoed": args["text"]}))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(Uuid::new_v4(), CancelToken::new())
    }

    #[tokio::test]
    async fn invoke_validates_then_dispatches() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::named("echo")).unwrap();

        let result = registry
            .invoke("echo", json!({"text": "hello"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!({"echoed": "hello"}));

        let err = registry
            .invoke("echo", json!({"text": 5}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, HarveyError::ArgumentInvalid { .. }));
    }

    #[tokio::test]
    async fn unknown_tools_are_reported_as_such() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, HarveyError::ToolNotFound { name } if name == "nope"));
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["iPricing", "summary", "subscriptions", "optimal"] {
            registry.register(EchoTool::named(name)).unwrap();
        }
        let names: Vec<&str> = registry.list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["iPricing", "summary", "subscriptions", "optimal"]);

        // Stable across repeated reads.
        let again: Vec<&str> = registry.list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, again);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::named("echo")).unwrap();
        assert!(registry.register(EchoTool::named("echo")).is_err());
    }
}
