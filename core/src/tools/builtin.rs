//! Built-in pricing tools
//!
//! The six contractual tools the agent offers: `iPricing`, `summary`,
//! `subscriptions`, `optimal`, `validate`, `filter`. Each is declared with
//! a strict schema and bound to the pricing workflow. A request is parsed
//! into the tagged [`ToolRequest`] before dispatch so the workflow's match
//! stays exhaustive over the tool vocabulary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::registry::{Tool, ToolContext, ToolRegistry};
use super::schema::{ObjectSchema, ParamSpec, ParamType, SideEffect, ToolDescriptor};
use crate::agent::workflow::PricingWorkflow;
use crate::error::{HarveyError, Result};
use crate::grounding::FilterCriteria;
use crate::mcp::client::McpClient;

/// Optimisation direction for the `optimal` tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Minimize,
    Maximize,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IPricingArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionsArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
    pub filters: Option<FilterCriteria>,
    pub solver: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
    pub filters: FilterCriteria,
    pub solver: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimalArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
    pub filters: Option<FilterCriteria>,
    pub solver: Option<String>,
    pub objective: Option<Objective>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateArgs {
    pub pricing_url: Option<String>,
    pub pricing_yaml: Option<String>,
    #[serde(default)]
    pub refresh: bool,
    pub solver: Option<String>,
}

/// A tool call as a sum over the known tool names. Dispatch is an
/// exhaustive match, so a new tool cannot be added without updating the
/// dispatcher.
#[derive(Debug, Clone)]
pub enum ToolRequest {
    IPricing(IPricingArgs),
    Summary(SummaryArgs),
    Subscriptions(SubscriptionsArgs),
    Optimal(OptimalArgs),
    Validate(ValidateArgs),
    Filter(FilterArgs),
}

impl ToolRequest {
    /// Parse validated JSON arguments into the typed request.
    pub fn parse(name: &str, args: Value) -> Result<Self> {
        fn decode<T: serde::de::DeserializeOwned>(name: &str, args: Value) -> Result<T> {
            serde_json::from_value(args).map_err(|e| HarveyError::ArgumentInvalid {
                path: format!("$ ({name})"),
                reason: e.to_string(),
            })
        }

        match name {
            "iPricing" => Ok(Self::IPricing(decode(name, args)?)),
            "summary" => Ok(Self::Summary(decode(name, args)?)),
            "subscriptions" => Ok(Self::Subscriptions(decode(name, args)?)),
            "optimal" => Ok(Self::Optimal(decode(name, args)?)),
            "validate" => Ok(Self::Validate(decode(name, args)?)),
            "filter" => Ok(Self::Filter(decode(name, args)?)),
            other => Err(HarveyError::ToolNotFound {
                name: other.to_string(),
            }),
        }
    }
}

fn filters_schema() -> ObjectSchema {
    ObjectSchema::new()
        .field(
            "minPrice",
            ParamSpec::number("lower price bound in the pricing's base currency")
                .optional()
                .minimum(0.0),
        )
        .field(
            "maxPrice",
            ParamSpec::number("upper price bound in the pricing's base currency")
                .optional()
                .minimum(0.0),
        )
        .field(
            "features",
            ParamSpec::new(
                ParamType::Array(Box::new(ParamType::String)),
                "feature names that must be present, exactly as in the pricing YAML",
            )
            .optional(),
        )
        .field(
            "usageLimits",
            ParamSpec::new(
                ParamType::Array(Box::new(ParamType::Map(Box::new(ParamType::Number)))),
                "minimum thresholds keyed by usage limit name; use 1 for boolean limits. \
                 A key may carry the limit's unit in parentheses, e.g. \"Seats (user)\"; \
                 it must match the unit declared in the pricing YAML",
            )
            .optional(),
        )
}

fn reference_fields(schema: ObjectSchema) -> ObjectSchema {
    schema
        .field(
            "pricing_url",
            ParamSpec::string("pricing page URL or uploaded:// alias").optional(),
        )
        .field(
            "pricing_yaml",
            ParamSpec::string("inline Pricing2Yaml content").optional(),
        )
        .field(
            "refresh",
            ParamSpec::boolean("force a fresh extraction instead of the cache").optional(),
        )
}

fn solver_field(schema: ObjectSchema) -> ObjectSchema {
    schema.field(
        "solver",
        ParamSpec::string("constraint solver")
            .optional()
            .one_of(&["minizinc", "choco"]),
    )
}

fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "iPricing".into(),
            description: "Return the canonical Pricing2Yaml document for a pricing page URL \
                          (via the A-MINT pipeline) or an uploaded YAML."
                .into(),
            input: reference_fields(ObjectSchema::new()),
            output_description: "{request, pricing_yaml, source}".into(),
            side_effect: SideEffect::Network,
        },
        ToolDescriptor {
            name: "summary".into(),
            description: "Counts and statistics for one pricing: features per category, plan \
                          metadata, quotas."
                .into(),
            input: reference_fields(ObjectSchema::new()),
            output_description: "{request, summary}".into(),
            side_effect: SideEffect::Network,
        },
        ToolDescriptor {
            name: "subscriptions".into(),
            description: "Enumerate every valid subscription configuration, optionally \
                          filtered; always includes the configuration-space cardinality."
                .into(),
            input: solver_field(reference_fields(
                ObjectSchema::new().field(
                    "filters",
                    ParamSpec::new(ParamType::Object(filters_schema()), "filter criteria")
                        .optional(),
                ),
            )),
            output_description: "{request, result} with cardinality".into(),
            side_effect: SideEffect::Network,
        },
        ToolDescriptor {
            name: "optimal".into(),
            description: "Run the optimiser over the configuration space and return the best \
                          configuration with its cost."
                .into(),
            input: solver_field(reference_fields(
                ObjectSchema::new()
                    .field(
                        "filters",
                        ParamSpec::new(ParamType::Object(filters_schema()), "filter criteria")
                            .optional(),
                    )
                    .field(
                        "objective",
                        ParamSpec::string("optimisation direction")
                            .optional()
                            .one_of(&["minimize", "maximize"]),
                    ),
            )),
            output_description: "{request, result} with the winning subscription".into(),
            side_effect: SideEffect::Network,
        },
        ToolDescriptor {
            name: "validate".into(),
            description: "Check that a pricing document is satisfiable under the declared \
                          constraints."
                .into(),
            input: solver_field(reference_fields(ObjectSchema::new())),
            output_description: "{request, result} with validity and errors".into(),
            side_effect: SideEffect::Network,
        },
        ToolDescriptor {
            name: "filter".into(),
            description: "Restrict the configuration space to the given filters and return \
                          the matching configurations."
                .into(),
            input: solver_field(reference_fields(ObjectSchema::new().field(
                "filters",
                ParamSpec::new(ParamType::Object(filters_schema()), "filter criteria"),
            ))),
            output_description: "{request, result} with the filtered space".into(),
            side_effect: SideEffect::Network,
        },
    ]
}

/// A built-in tool bound to the in-process workflow
struct WorkflowTool {
    descriptor: ToolDescriptor,
    workflow: Arc<PricingWorkflow>,
}

#[async_trait]
impl Tool for WorkflowTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let request = ToolRequest::parse(&self.descriptor.name, args)?;
        self.workflow.execute(request, ctx).await
    }
}

/// The alternative deployment: the same catalogue, but every call crosses
/// the MCP boundary to an external server.
struct McpProxyTool {
    descriptor: ToolDescriptor,
    client: Arc<McpClient>,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        self.client.call_tool(&self.descriptor.name, args).await
    }
}

/// Register the six built-in tools dispatching to the in-process workflow.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    workflow: Arc<PricingWorkflow>,
) -> Result<()> {
    for descriptor in descriptors() {
        registry.register(Arc::new(WorkflowTool {
            descriptor,
            workflow: workflow.clone(),
        }))?;
    }
    Ok(())
}

/// Register the six tools proxied through an MCP server instead.
pub fn register_mcp_tools(registry: &mut ToolRegistry, client: Arc<McpClient>) -> Result<()> {
    for descriptor in descriptors() {
        registry.register(Arc::new(McpProxyTool {
            descriptor,
            client: client.clone(),
        }))?;
    }
    Ok(())
}
