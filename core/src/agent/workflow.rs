//! Pricing workflow
//!
//! The implementations behind the six built-in tools. Every operation first
//! resolves its pricing reference (uploaded alias or URL through the cache),
//! grounds any filters against that document, and only then talks to the
//! analysis service. A grounding failure therefore never reaches the solver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::clients::analysis::{await_job, AnalysisApi};
use crate::error::{HarveyError, Result};
use crate::grounding::{ground_filters, FilterCriteria, MatchPolicy};
use crate::pricing::cache::{PricingCache, WaiterTag};
use crate::pricing::catalog::PricingCatalog;
use crate::pricing::context::CanonicalUrl;
use crate::tools::builtin::{Objective, ToolRequest};
use crate::tools::registry::ToolContext;

const DEFAULT_SOLVER: &str = "minizinc";

/// Executes tool requests against the cache, grounding layer and analysis
/// service.
pub struct PricingWorkflow {
    cache: Arc<PricingCache>,
    analysis: Arc<dyn AnalysisApi>,
    policy: MatchPolicy,
    poll_budget: Duration,
}

/// A pricing document resolved for one tool call
struct ResolvedPricing {
    yaml: String,
    url: Option<String>,
    source: &'static str,
}

impl PricingWorkflow {
    pub fn new(
        cache: Arc<PricingCache>,
        analysis: Arc<dyn AnalysisApi>,
        policy: MatchPolicy,
        poll_budget: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            analysis,
            policy,
            poll_budget,
        })
    }

    /// Exhaustive dispatch over the tool vocabulary. Adding a tool name
    /// forces a new arm here.
    pub async fn execute(&self, request: ToolRequest, ctx: &ToolContext) -> Result<Value> {
        match request {
            ToolRequest::IPricing(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                Ok(json!({
                    "request": {"url": pricing.url, "refresh": args.refresh},
                    "pricing_yaml": pricing.yaml,
                    "source": pricing.source,
                }))
            }

            ToolRequest::Summary(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                let summary = self.analysis.summary(&pricing.yaml, &ctx.cancel).await?;
                Ok(json!({
                    "request": {"url": pricing.url, "refresh": args.refresh},
                    "summary": summary,
                }))
            }

            ToolRequest::Subscriptions(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                let filters = self.ground(&pricing.yaml, args.filters.as_ref())?;
                let solver = args.solver.as_deref().unwrap_or(DEFAULT_SOLVER);
                // A filtered enumeration is a different remote operation.
                let operation = if filters.is_some() { "filter" } else { "subscriptions" };
                let result = self
                    .run_job(&pricing.yaml, operation, solver, filters.as_ref(), None, ctx)
                    .await?;
                Ok(json!({
                    "request": {"url": pricing.url, "filters": filters, "solver": solver},
                    "result": result,
                }))
            }

            ToolRequest::Filter(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                let filters = self
                    .ground(&pricing.yaml, Some(&args.filters))?
                    .unwrap_or_default();
                let solver = args.solver.as_deref().unwrap_or(DEFAULT_SOLVER);
                let result = self
                    .run_job(&pricing.yaml, "filter", solver, Some(&filters), None, ctx)
                    .await?;
                Ok(json!({
                    "request": {"url": pricing.url, "filters": filters, "solver": solver},
                    "result": result,
                }))
            }

            ToolRequest::Optimal(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                let filters = self.ground(&pricing.yaml, args.filters.as_ref())?;
                let solver = args.solver.as_deref().unwrap_or(DEFAULT_SOLVER);
                let objective = args.objective.unwrap_or(Objective::Minimize);
                let result = self
                    .run_job(
                        &pricing.yaml,
                        "optimal",
                        solver,
                        filters.as_ref(),
                        Some(objective.as_str()),
                        ctx,
                    )
                    .await?;
                Ok(json!({
                    "request": {
                        "url": pricing.url,
                        "filters": filters,
                        "solver": solver,
                        "objective": objective.as_str(),
                    },
                    "result": result,
                }))
            }

            ToolRequest::Validate(args) => {
                let pricing = self
                    .resolve_pricing(&args.pricing_url, &args.pricing_yaml, args.refresh, ctx)
                    .await?;
                let solver = args.solver.as_deref().unwrap_or(DEFAULT_SOLVER);
                let result = self
                    .run_job(&pricing.yaml, "validate", solver, None, None, ctx)
                    .await?;
                Ok(json!({
                    "request": {"url": pricing.url, "solver": solver, "refresh": args.refresh},
                    "result": result,
                }))
            }
        }
    }

    /// Resolve the pricing document a call refers to: inline YAML beats an
    /// uploaded alias beats a URL through the cache.
    async fn resolve_pricing(
        &self,
        pricing_url: &Option<String>,
        pricing_yaml: &Option<String>,
        refresh: bool,
        ctx: &ToolContext,
    ) -> Result<ResolvedPricing> {
        if let Some(yaml) = pricing_yaml.as_deref().filter(|y| !y.trim().is_empty()) {
            return Ok(ResolvedPricing {
                yaml: yaml.to_string(),
                url: None,
                source: "upload",
            });
        }

        let reference = pricing_url
            .clone()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| ctx.default_reference.clone())
            .ok_or_else(|| HarveyError::BadRequest {
                message:
                    "Provide at least one pricing URL or Pricing2Yaml upload before calling tooling."
                        .into(),
            })?;

        if let Some(yaml) = ctx.aliases.get(&reference) {
            return Ok(ResolvedPricing {
                yaml: yaml.clone(),
                url: Some(reference),
                source: "upload",
            });
        }

        let canonical = CanonicalUrl::parse(&reference)?;
        if refresh {
            self.cache.invalidate(&canonical).await;
        }
        let item_id = ctx
            .url_items
            .get(canonical.as_str())
            .copied()
            .unwrap_or_else(Uuid::new_v4);
        let tag = WaiterTag {
            session_id: ctx.session_id,
            item_id,
        };
        info!(url = %canonical, "resolving pricing context");
        let yaml = self.cache.resolve(&canonical, tag).await?;
        Ok(ResolvedPricing {
            yaml: (*yaml).clone(),
            url: Some(canonical.to_string()),
            source: "amint",
        })
    }

    /// Ground a filter object against the document in scope.
    fn ground(
        &self,
        yaml: &str,
        filters: Option<&FilterCriteria>,
    ) -> Result<Option<FilterCriteria>> {
        match filters {
            Some(filters) if !filters.is_empty() => {
                let catalog = PricingCatalog::parse(yaml)?;
                Ok(Some(ground_filters(&catalog, filters, self.policy)?))
            }
            _ => Ok(None),
        }
    }

    async fn run_job(
        &self,
        yaml: &str,
        operation: &str,
        solver: &str,
        filters: Option<&FilterCriteria>,
        objective: Option<&str>,
        ctx: &ToolContext,
    ) -> Result<Value> {
        let job_id = self
            .analysis
            .submit(yaml, operation, solver, filters, objective, &ctx.cancel)
            .await?;
        await_job(self.analysis.as_ref(), &job_id, self.poll_budget, &ctx.cancel).await
    }
}
