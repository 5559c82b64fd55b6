//! The Harvey agent loop
//!
//! ReAct over native tool calling: each step offers the registry's
//! catalogue to the LLM, executes any requested tool calls concurrently,
//! and appends the observations in call-declaration order. The loop is
//! bounded by a step budget and per-step/per-tool timeouts, honours the
//! session's cancellation token at every suspension point, and never lets
//! a tool failure terminate the session: errors become observations the
//! model can recover from.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::prompt::{build_system_prompt, should_include_spec};
use crate::config::AgentLimits;
use crate::error::{HarveyError, Result};
use crate::llm::chat::{ChatMessage, ChatRequest, ChatResponse, ToolCall};
use crate::llm::client::ChatClient;
use crate::llm::TokenUsage;
use crate::mcp::SpecResource;
use crate::session::{AgentStep, Session, SessionStatus, ToolCallRecord};
use crate::tools::registry::{ToolContext, ToolRegistry};
use crate::tools::schema::canonicalize;

/// Result of one chat turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub answer: String,
    pub plan: Option<Value>,
    pub result: Option<Value>,
    pub status: SessionStatus,
    pub usage: TokenUsage,
}

/// ReAct planner/executor over the tool registry
pub struct HarveyAgent {
    llm: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    limits: AgentLimits,
    spec: Option<Arc<SpecResource>>,
}

impl HarveyAgent {
    pub fn new(
        llm: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        limits: AgentLimits,
        spec: Option<Arc<SpecResource>>,
    ) -> Self {
        Self {
            llm,
            registry,
            limits,
            spec,
        }
    }

    /// Run one turn for `question` inside `session`.
    ///
    /// Tool and grounding errors stay local to their step; LLM transport
    /// failures and cancellation terminate the turn.
    pub async fn run_turn(
        &self,
        session: &Arc<Mutex<Session>>,
        question: &str,
        ctx: &ToolContext,
    ) -> Result<TurnOutcome> {
        let history = {
            let mut session = session.lock().await;
            session.status = SessionStatus::Running;
            session.push_message(crate::llm::MessageRole::User, question);
            session
                .conversation
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.content.clone(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                })
                .collect::<Vec<_>>()
        };
        let urls: Vec<String> = {
            let mut urls: Vec<String> = ctx.url_items.keys().cloned().collect();
            urls.sort();
            urls
        };
        let aliases: Vec<String> = {
            let mut aliases: Vec<String> = ctx.aliases.keys().cloned().collect();
            aliases.sort();
            aliases
        };

        let spec_excerpt = match (&self.spec, should_include_spec(question)) {
            (Some(spec), true) => spec.excerpt().await,
            _ => None,
        };

        let system = build_system_prompt(
            &self.registry.list(),
            &urls,
            &aliases,
            spec_excerpt.as_deref(),
        );
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history);

        let tools = self.registry.chat_tools();
        let mut usage = TokenUsage::default();
        let mut step_payloads: Vec<Value> = Vec::new();
        let mut actions: Vec<Value> = Vec::new();
        let mut grounded_filters: Option<Value> = None;
        let mut call_counter: usize = 0;

        for step_index in 0..self.limits.step_budget {
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(session).await;
            }

            let request = ChatRequest::new(self.llm.model().to_string(), messages.clone())
                .with_tools(tools.clone());
            let started = Instant::now();
            let response = match self.step_completion(&request, ctx).await {
                Ok(response) => response,
                Err(HarveyError::Cancelled) => return self.finish_cancelled(session).await,
                Err(err) => {
                    warn!(error = %err, "LLM turn failed; session fails");
                    session.lock().await.status = SessionStatus::Failed;
                    return Err(err);
                }
            };
            if let Some(step_usage) = &response.usage {
                usage.add(&TokenUsage {
                    prompt_tokens: step_usage.prompt_tokens,
                    completion_tokens: step_usage.completion_tokens,
                    total_tokens: step_usage.total_tokens,
                });
            }

            let Some(calls) = response.tool_calls().map(<[ToolCall]>::to_vec) else {
                // Final answer.
                let answer = response.content();
                return self
                    .finish_answered(
                        session,
                        answer,
                        SessionStatus::Answered,
                        actions,
                        grounded_filters,
                        step_payloads,
                        usage,
                    )
                    .await;
            };

            debug!(step = step_index, calls = calls.len(), "executing tool fan-out");
            let assistant = response
                .choices
                .first()
                .map(|choice| choice.message.clone())
                .unwrap_or_else(|| ChatMessage::assistant(""));
            messages.push(assistant);

            // Execute concurrently; join_all preserves declaration order.
            let futures = calls.iter().map(|call| self.execute_call(call, ctx));
            let observations: Vec<Value> = join_all(futures).await;

            let mut records = Vec::with_capacity(calls.len());
            for (call, observation) in calls.iter().zip(&observations) {
                let arguments = parse_arguments(&call.function.arguments)
                    .map(|value| canonicalize(&value))
                    .unwrap_or(Value::Null);
                if let Some(filters) = observation.pointer("/request/filters") {
                    if !filters.is_null() {
                        grounded_filters = Some(filters.clone());
                    }
                }
                actions.push(Value::String(call.function.name.clone()));
                step_payloads.push(json!({
                    "index": call_counter,
                    "action": call.function.name,
                    "payload": observation,
                }));
                call_counter += 1;
                records.push(ToolCallRecord {
                    name: call.function.name.clone(),
                    arguments,
                });

                let observation_text = serde_json::to_string(observation)
                    .unwrap_or_else(|_| "{\"error\":\"unserializable observation\"}".to_string());
                let call_id = if call.id.is_empty() {
                    format!("call_{call_counter}")
                } else {
                    call.id.clone()
                };
                messages.push(ChatMessage::tool(
                    call_id,
                    call.function.name.clone(),
                    observation_text,
                ));
            }

            let step = AgentStep {
                index: step_index,
                thought: response.content(),
                tool_calls: records,
                observations,
                duration_ms: started.elapsed().as_millis() as u64,
                tokens_in: response.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                tokens_out: response.usage.map(|u| u.completion_tokens).unwrap_or(0),
            };
            session.lock().await.push_step(step)?;

            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(session).await;
            }
        }

        // Budget exhausted: force a final answer, offering no tools.
        info!(budget = self.limits.step_budget, "step budget reached, forcing final answer");
        messages.push(ChatMessage::user(
            "Observation: step budget reached. Provide your final answer now from the \
             information already gathered.",
        ));
        let request = ChatRequest::new(self.llm.model().to_string(), messages);
        let response = match self.step_completion(&request, ctx).await {
            Ok(response) => response,
            Err(HarveyError::Cancelled) => return self.finish_cancelled(session).await,
            Err(err) => {
                session.lock().await.status = SessionStatus::Failed;
                return Err(err);
            }
        };
        if let Some(step_usage) = &response.usage {
            usage.add(&TokenUsage {
                prompt_tokens: step_usage.prompt_tokens,
                completion_tokens: step_usage.completion_tokens,
                total_tokens: step_usage.total_tokens,
            });
        }
        let answer = response.content();
        self.finish_answered(
            session,
            answer,
            SessionStatus::BudgetExhausted,
            actions,
            grounded_filters,
            step_payloads,
            usage,
        )
        .await
    }

    /// One LLM completion bounded by the per-step wall clock.
    async fn step_completion(
        &self,
        request: &ChatRequest,
        ctx: &ToolContext,
    ) -> Result<ChatResponse> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(HarveyError::Cancelled),
            result = tokio::time::timeout(self.limits.step_timeout, self.llm.chat(request)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(HarveyError::Timeout {
                        duration: self.limits.step_timeout,
                    }),
                }
            }
        }
    }

    /// Execute one tool call; every failure becomes a structured
    /// observation rather than an error.
    async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> Value {
        let name = call.function.name.as_str();
        let args = match parse_arguments(&call.function.arguments) {
            Ok(args) => args,
            Err(err) => return error_observation(&err),
        };

        let invocation = self.registry.invoke(name, args, ctx);
        match tokio::time::timeout(self.limits.tool_timeout, invocation).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                debug!(tool = name, error = %err, "tool call failed");
                error_observation(&err)
            }
            Err(_) => error_observation(&HarveyError::Timeout {
                duration: self.limits.tool_timeout,
            }),
        }
    }

    async fn finish_cancelled(&self, session: &Arc<Mutex<Session>>) -> Result<TurnOutcome> {
        let mut session = session.lock().await;
        session.status = SessionStatus::Cancelled;
        info!(session_id = %session.id, "turn cancelled; partial transcript retained");
        Err(HarveyError::Cancelled)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_answered(
        &self,
        session: &Arc<Mutex<Session>>,
        answer: String,
        status: SessionStatus,
        actions: Vec<Value>,
        grounded_filters: Option<Value>,
        step_payloads: Vec<Value>,
        usage: TokenUsage,
    ) -> Result<TurnOutcome> {
        let plan = if actions.is_empty() && grounded_filters.is_none() {
            None
        } else {
            Some(json!({
                "actions": actions,
                "filters": grounded_filters,
            }))
        };
        let result = compose_result(&step_payloads);

        let mut session = session.lock().await;
        session.push_message(crate::llm::MessageRole::Assistant, answer.clone());
        session.status = status;
        Ok(TurnOutcome {
            answer,
            plan,
            result,
            status,
            usage,
        })
    }
}

fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| HarveyError::ArgumentInvalid {
        path: "$".into(),
        reason: format!("arguments are not valid JSON: {e}"),
    })
}

/// Shape tool failures the way the LLM consumes them.
fn error_observation(err: &HarveyError) -> Value {
    json!({
        "error": {
            "kind": err.kind_code(),
            "message": err.to_string(),
        }
    })
}

/// A single executed call returns its own record; several are wrapped with
/// the action list and the last payload.
fn compose_result(step_payloads: &[Value]) -> Option<Value> {
    match step_payloads {
        [] => None,
        [single] => Some(single.clone()),
        many => Some(json!({
            "actions": many
                .iter()
                .map(|step| step["action"].clone())
                .collect::<Vec<_>>(),
            "steps": many,
            "lastPayload": many.last().map(|step| step["payload"].clone()),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::{Choice, ToolCallFunction, Usage};
    use crate::session::SessionStore;
    use crate::tools::schema::{ObjectSchema, ParamSpec, SideEffect, ToolDescriptor};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted model: pops one response per chat call, records requests.
    struct ScriptedChat {
        responses: StdMutex<VecDeque<ChatResponse>>,
        requests: StdMutex<Vec<ChatRequest>>,
    }

    impl ScriptedChat {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| HarveyError::internal("script exhausted"))
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
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    fn tool_calls(calls: &[(&str, &str, Value)]) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: id.to_string(),
                type_: "function".into(),
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            })
            .collect();
        ChatResponse {
            id: "resp".into(),
            model: "scripted".into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: crate::llm::MessageRole::Assistant,
                    content: "calling tools".into(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: Some(tool_calls),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    /// Test tool with a configurable delay and outcome.
    struct TestTool {
        descriptor: ToolDescriptor,
        delay: Duration,
        fail: bool,
    }

    impl TestTool {
        fn named(name: &str, delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                descriptor: ToolDescriptor {
                    name: name.to_string(),
                    description: "test tool".into(),
                    input: ObjectSchema::new()
                        .field("label", ParamSpec::string("label").optional()),
                    output_description: "test".into(),
                    side_effect: SideEffect::Pure,
                },
                delay,
                fail,
            })
        }
    }

    #[async_trait]
    impl crate::tools::registry::Tool for TestTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(HarveyError::SolverError {
                    message: "model infeasible".into(),
                });
            }
            Ok(json!({"tool": self.descriptor.name}))
        }
    }

    fn registry(tools: &[Arc<TestTool>]) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool.clone()).unwrap();
        }
        Arc::new(registry)
    }

    fn limits(budget: usize) -> AgentLimits {
        AgentLimits {
            step_budget: budget,
            step_budget_hard_cap: 16,
            step_timeout: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(5),
        }
    }

    async fn run(
        llm: Arc<ScriptedChat>,
        registry: Arc<ToolRegistry>,
        budget: usize,
    ) -> (Result<TurnOutcome>, Arc<Mutex<Session>>) {
        let agent = HarveyAgent::new(llm, registry, limits(budget), None);
        let store = SessionStore::new(Duration::from_secs(60));
        let (id, session) = store.create().await;
        let token = session.lock().await.cancel_token();
        let ctx = ToolContext::new(id, token);
        let outcome = agent
            .run_turn(&session, "what is the cheapest plan?", &ctx)
            .await;
        (outcome, session)
    }

    #[tokio::test]
    async fn direct_answers_take_no_steps() {
        let llm = ScriptedChat::new(vec![answer("The cheapest plan is FREE.")]);
        let (outcome, session) = run(llm, registry(&[]), 8).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, SessionStatus::Answered);
        assert_eq!(outcome.answer, "The cheapest plan is FREE.");
        assert!(outcome.plan.is_none());
        assert!(outcome.result.is_none());
        assert_eq!(session.lock().await.steps.len(), 0);
    }

    #[tokio::test]
    async fn observations_follow_call_declaration_order() {
        let slow = TestTool::named("slow", Duration::from_millis(60), false);
        let fast = TestTool::named("fast", Duration::from_millis(1), false);
        let llm = ScriptedChat::new(vec![
            tool_calls(&[
                ("call_a", "slow", json!({})),
                ("call_b", "fast", json!({})),
            ]),
            answer("done"),
        ]);

        let (outcome, session) = run(llm.clone(), registry(&[slow, fast]), 8).await;
        assert_eq!(outcome.unwrap().status, SessionStatus::Answered);

        let session = session.lock().await;
        assert_eq!(session.steps.len(), 1);
        let step = &session.steps[0];
        assert_eq!(step.index, 0);
        assert_eq!(step.observations[0]["tool"], "slow");
        assert_eq!(step.observations[1]["tool"], "fast");

        // The transcript sent back to the model keeps the same order.
        let requests = llm.requests.lock().unwrap();
        let final_request = requests.last().unwrap();
        let tool_messages: Vec<&ChatMessage> = final_request
            .messages
            .iter()
            .filter(|m| m.role == crate::llm::MessageRole::Tool)
            .collect();
        assert_eq!(tool_messages[0].name.as_deref(), Some("slow"));
        assert_eq!(tool_messages[1].name.as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn tool_errors_become_observations_and_the_loop_continues() {
        let failing = TestTool::named("optimal", Duration::from_millis(1), true);
        let llm = ScriptedChat::new(vec![
            tool_calls(&[("call_a", "optimal", json!({}))]),
            answer("The solver reported the model is infeasible."),
        ]);

        let (outcome, session) = run(llm, registry(&[failing]), 8).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, SessionStatus::Answered);
        assert!(outcome.answer.contains("infeasible"));

        let session = session.lock().await;
        let observation = &session.steps[0].observations[0];
        assert_eq!(observation["error"]["kind"], "solver_error");
        assert!(observation["error"]["message"]
            .as_str()
            .unwrap()
            .contains("model infeasible"));
    }

    #[tokio::test]
    async fn unknown_tools_are_observed_not_fatal() {
        let llm = ScriptedChat::new(vec![
            tool_calls(&[("call_a", "export", json!({}))]),
            answer("I cannot export."),
        ]);
        let (outcome, session) = run(llm, registry(&[]), 8).await;
        assert_eq!(outcome.unwrap().status, SessionStatus::Answered);
        let session = session.lock().await;
        assert_eq!(
            session.steps[0].observations[0]["error"]["kind"],
            "tool_not_found"
        );
    }

    #[tokio::test]
    async fn budget_exhaustion_forces_a_final_answer_without_tools() {
        let tool = TestTool::named("summary", Duration::from_millis(1), false);
        let llm = ScriptedChat::new(vec![
            tool_calls(&[("call_a", "summary", json!({}))]),
            tool_calls(&[("call_b", "summary", json!({}))]),
            answer("Based on what I gathered, there are 3 features."),
        ]);

        let (outcome, session) = run(llm.clone(), registry(&[tool]), 2).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, SessionStatus::BudgetExhausted);

        let session = session.lock().await;
        assert_eq!(session.steps.len(), 2);
        assert_eq!(session.steps[0].index, 0);
        assert_eq!(session.steps[1].index, 1);

        // The forced-answer request offers no tools and carries the
        // synthetic budget observation.
        let requests = llm.requests.lock().unwrap();
        let last = requests.last().unwrap();
        assert!(last.tools.is_none());
        assert!(last
            .messages
            .iter()
            .any(|m| m.content.contains("step budget reached")));
    }

    #[tokio::test]
    async fn cancellation_preserves_the_partial_transcript() {
        let llm = ScriptedChat::new(vec![answer("never used")]);
        let agent = HarveyAgent::new(llm, registry(&[]), limits(8), None);
        let store = SessionStore::new(Duration::from_secs(60));
        let (id, session) = store.create().await;
        let token = session.lock().await.cancel_token();
        token.cancel();
        let ctx = ToolContext::new(id, token);

        let err = agent
            .run_turn(&session, "cheapest plan?", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HarveyError::Cancelled));
        assert_eq!(session.lock().await.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn multi_step_results_collect_actions_and_payloads() {
        let tool = TestTool::named("summary", Duration::from_millis(1), false);
        let llm = ScriptedChat::new(vec![
            tool_calls(&[("call_a", "summary", json!({}))]),
            tool_calls(&[("call_b", "summary", json!({}))]),
            answer("done"),
        ]);
        let (outcome, _session) = run(llm, registry(&[tool]), 8).await;
        let outcome = outcome.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result["steps"].as_array().unwrap().len(), 2);
        assert_eq!(result["actions"], json!(["summary", "summary"]));
        let plan = outcome.plan.unwrap();
        assert_eq!(plan["actions"], json!(["summary", "summary"]));
    }
}
