//! End-to-end agent flows over scripted seams: a scripted LLM, a spy
//! extractor behind the real cache, and a spy analysis client behind the
//! real registry, grounding layer and workflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use harvey_core::agent::{HarveyAgent, PricingWorkflow};
use harvey_core::bus::{BusMessage, NotificationBus, TransformPhase};
use harvey_core::clients::analysis::{AnalysisApi, AnalysisJob, JobStatus};
use harvey_core::config::{AgentLimits, CacheSettings};
use harvey_core::error::{HarveyError, Result};
use harvey_core::grounding::{FilterCriteria, MatchPolicy};
use harvey_core::llm::chat::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ToolCall, ToolCallFunction, Usage,
};
use harvey_core::llm::client::ChatClient;
use harvey_core::llm::MessageRole;
use harvey_core::pricing::cache::{Extractor, PricingCache, WaiterTag};
use harvey_core::pricing::context::CanonicalUrl;
use harvey_core::session::{CancelToken, SessionStore};
use harvey_core::tools::builtin::register_builtin_tools;
use harvey_core::tools::registry::{ToolContext, ToolRegistry};

const PRICING_YAML: &str = r#"
saasName: ExampleCRM
currency: USD
features:
  SSO:
    valueType: BOOLEAN
    defaultValue: false
usageLimits:
  Seats:
    valueType: NUMERIC
    defaultValue: 1
    unit: user
plans:
  FREE:
    price: 0
  PRO:
    price: 35.0
"#;

struct SpyExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl Extractor for SpyExtractor {
    async fn transform(&self, _url: &CanonicalUrl) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(PRICING_YAML.to_string())
    }
}

struct SpyAnalysis {
    submissions: StdMutex<Vec<(String, Option<FilterCriteria>, Option<String>)>>,
    fail_with: Option<String>,
}

impl SpyAnalysis {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            submissions: StdMutex::new(Vec::new()),
            fail_with: None,
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            submissions: StdMutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        })
    }
}

#[async_trait]
impl AnalysisApi for SpyAnalysis {
    async fn summary(&self, _yaml: &str, _cancel: &CancelToken) -> Result<Value> {
        Ok(json!({"numberOfFeatures": 1}))
    }

    async fn submit(
        &self,
        _yaml: &str,
        operation: &str,
        _solver: &str,
        filters: Option<&FilterCriteria>,
        objective: Option<&str>,
        _cancel: &CancelToken,
    ) -> Result<String> {
        self.submissions.lock().unwrap().push((
            operation.to_string(),
            filters.cloned(),
            objective.map(str::to_string),
        ));
        Ok("job-1".into())
    }

    async fn status(&self, job_id: &str, _cancel: &CancelToken) -> Result<AnalysisJob> {
        let (status, result, error) = match &self.fail_with {
            Some(message) => (JobStatus::Failed, None, Some(message.clone())),
            None => (
                JobStatus::Completed,
                Some(json!({
                    "optimal": {"subscription": {"plan": "PRO", "addOns": []}, "cost": 35.0},
                    "cardinality": 4
                })),
                None,
            ),
        };
        Ok(AnalysisJob {
            job_id: job_id.to_string(),
            status,
            submitted_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
            result,
            error,
        })
    }
}

struct ScriptedChat {
    responses: StdMutex<VecDeque<ChatResponse>>,
}

impl ScriptedChat {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HarveyError::Internal {
                message: "script exhausted".into(),
            })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

fn answer(text: &str) -> ChatResponse {
    ChatResponse {
        id: "resp".into(),
        model: "scripted".into(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(text),
            finish_reason: Some("stop".into()),
        }],
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
    }
}

fn tool_call(name: &str, args: Value) -> ChatResponse {
    ChatResponse {
        id: "resp".into(),
        model: "scripted".into(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: String::new(),
                name: None,
                tool_call_id: None,
                tool_calls: Some(vec![ToolCall {
                    id: "call_1".into(),
                    type_: "function".into(),
                    function: ToolCallFunction {
                        name: name.to_string(),
                        arguments: args.to_string(),
                    },
                }]),
            },
            finish_reason: Some("tool_calls".into()),
        }],
        usage: None,
    }
}

struct Harness {
    agent: HarveyAgent,
    sessions: SessionStore,
    cache: Arc<PricingCache>,
    bus: NotificationBus,
    extractor_calls: Arc<SpyExtractor>,
}

fn harness(llm: Arc<ScriptedChat>, analysis: Arc<SpyAnalysis>) -> Harness {
    let extractor = Arc::new(SpyExtractor {
        calls: AtomicUsize::new(0),
    });
    let bus = NotificationBus::new();
    let cache = PricingCache::new(extractor.clone(), bus.clone(), CacheSettings::default());
    let workflow = PricingWorkflow::new(
        cache.clone(),
        analysis,
        MatchPolicy::default(),
        Duration::from_secs(30),
    );
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, workflow).unwrap();
    let agent = HarveyAgent::new(llm, Arc::new(registry), AgentLimits::default(), None);
    Harness {
        agent,
        sessions: SessionStore::new(Duration::from_secs(60)),
        cache,
        bus,
        extractor_calls: extractor,
    }
}

#[tokio::test]
async fn cheapest_plan_over_a_single_url() {
    let analysis = SpyAnalysis::ok();
    let llm = ScriptedChat::new(vec![
        tool_call(
            "optimal",
            json!({
                "pricing_url": "https://example.com/pricing",
                "filters": {"features": ["sso"], "usageLimits": [{"seats": 10}]},
                "objective": "minimize"
            }),
        ),
        answer("The cheapest plan including SSO for 10 users is PRO at $35."),
    ]);

    let h = harness(llm, analysis.clone());
    let (session_id, session) = h.sessions.create().await;
    let token = session.lock().await.cancel_token();
    let mut ctx = ToolContext::new(session_id, token);
    ctx.default_reference = Some("https://example.com/pricing".into());

    let outcome = h
        .agent
        .run_turn(&session, "What is the cheapest plan including SSO for 10 users?", &ctx)
        .await
        .unwrap();

    // Exactly one extractor call for the uncached URL.
    assert_eq!(h.extractor_calls.calls.load(Ordering::SeqCst), 1);

    // The submitted filter was grounded to canonical names.
    let submissions = analysis.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 1);
    let (operation, filters, objective) = &submissions[0];
    assert_eq!(operation, "optimal");
    assert_eq!(objective.as_deref(), Some("minimize"));
    let filters = filters.as_ref().unwrap();
    assert_eq!(filters.features, vec!["SSO"]);
    assert_eq!(filters.usage_limits[0].get("Seats"), Some(&10.0));

    // The answer names the plan and the plan metadata carries the grounded
    // filter.
    assert!(outcome.answer.contains("PRO"));
    let plan = outcome.plan.unwrap();
    assert_eq!(plan["filters"]["features"][0], "SSO");
    let result = outcome.result.unwrap();
    assert_eq!(result["payload"]["result"]["optimal"]["cost"], 35.0);
}

#[tokio::test]
async fn concurrent_sessions_share_one_transformation() {
    let url = CanonicalUrl::parse("https://example.com/pricing").unwrap();
    let h = harness(ScriptedChat::new(vec![]), SpyAnalysis::ok());

    let first = WaiterTag {
        session_id: uuid::Uuid::new_v4(),
        item_id: uuid::Uuid::new_v4(),
    };
    let second = WaiterTag {
        session_id: uuid::Uuid::new_v4(),
        item_id: uuid::Uuid::new_v4(),
    };
    let mut first_events = h.bus.subscribe(first.session_id);
    let mut second_events = h.bus.subscribe(second.session_id);

    let (a, b) = tokio::join!(h.cache.resolve(&url, first), h.cache.resolve(&url, second));
    assert_eq!(a.unwrap().as_str(), b.unwrap().as_str());
    assert_eq!(h.extractor_calls.calls.load(Ordering::SeqCst), 1);

    for (events, tag) in [(&mut first_events, &first), (&mut second_events, &second)] {
        match events.recv().await {
            Some(BusMessage::Event(event)) => {
                assert_eq!(event.session_id, tag.session_id);
                assert_eq!(event.id, tag.item_id);
                assert_eq!(event.state, TransformPhase::Done);
            }
            other => panic!("expected one event per session, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unknown_feature_is_offered_back_to_the_model() {
    let analysis = SpyAnalysis::ok();
    let llm = ScriptedChat::new(vec![
        tool_call(
            "subscriptions",
            json!({
                "pricing_url": "https://example.com/pricing",
                "filters": {"features": ["SsoPlus"]}
            }),
        ),
        answer("I could not find a feature called SsoPlus; did you mean SSO?"),
    ]);

    let h = harness(llm, analysis.clone());
    let (session_id, session) = h.sessions.create().await;
    let token = session.lock().await.cancel_token();
    let ctx = ToolContext::new(session_id, token);

    let outcome = h
        .agent
        .run_turn(&session, "plans with SsoPlus?", &ctx)
        .await
        .unwrap();

    // No analysis call was made and the grounding failure reached the
    // model as a structured observation.
    assert!(analysis.submissions.lock().unwrap().is_empty());
    let session = session.lock().await;
    let observation = &session.steps[0].observations[0];
    assert_eq!(observation["error"]["kind"], "unknown_feature");
    assert!(outcome.answer.contains("SsoPlus"));
}

#[tokio::test]
async fn solver_failure_ends_in_a_normal_answer() {
    let analysis = SpyAnalysis::failing("model infeasible");
    let llm = ScriptedChat::new(vec![
        tool_call(
            "optimal",
            json!({"pricing_url": "https://example.com/pricing"}),
        ),
        answer("The solver reported the pricing model is infeasible, so no plan satisfies the constraints."),
    ]);

    let h = harness(llm, analysis);
    let (session_id, session) = h.sessions.create().await;
    let token = session.lock().await.cancel_token();
    let ctx = ToolContext::new(session_id, token);

    let outcome = h
        .agent
        .run_turn(&session, "cheapest plan?", &ctx)
        .await
        .unwrap();

    assert_eq!(
        outcome.status,
        harvey_core::session::SessionStatus::Answered
    );
    assert!(outcome.answer.contains("infeasible"));
    let session = session.lock().await;
    assert_eq!(session.steps[0].observations[0]["error"]["kind"], "solver_error");
}
