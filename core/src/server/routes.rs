//! HTTP route handlers
//!
//! The chat facade: `/chat` dispatches a question to the agent, `/events`
//! streams cache notifications per session over SSE, `/upload`,
//! `/pricing/{id}` and `/static/{id}` manage YAML artifacts.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::OnceLock;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::bus::BusMessage;
use crate::error::HarveyError;
use crate::pricing::cache::WaiterTag;
use crate::pricing::context::{
    CanonicalUrl, ItemKind, ItemOrigin, PricingContextItem, TransformState,
};
use crate::tools::registry::ToolContext;

/// Request body for `POST /chat`
#[derive(Debug, Default, Deserialize)]
pub struct ChatBody {
    pub question: String,
    pub pricing_url: Option<String>,
    pub pricing_urls: Option<Vec<String>>,
    pub pricing_yaml: Option<String>,
    pub pricing_yamls: Option<Vec<String>>,
    /// Continue an existing conversation instead of starting a new one
    pub session_id: Option<Uuid>,
}

/// Response body for `POST /chat`
#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub session_id: Uuid,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "UP"}))
}

pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatReply>, ApiError> {
    let question = body.question.trim().to_string();
    if question.is_empty() {
        return Err(HarveyError::BadRequest {
            message: "Question is required.".into(),
        }
        .into());
    }

    // Merge singular/plural fields and auto-detected URLs, preserving order.
    let mut raw_urls = dedupe(
        body.pricing_url
            .into_iter()
            .chain(body.pricing_urls.unwrap_or_default()),
    );
    let provided_count = raw_urls.len();
    for detected in detect_urls(&question) {
        if !raw_urls.contains(&detected) {
            raw_urls.push(detected);
        }
    }
    let yamls = dedupe(
        body.pricing_yaml
            .into_iter()
            .chain(body.pricing_yamls.unwrap_or_default())
            .map(|y| y.trim().to_string())
            .filter(|y| !y.is_empty()),
    );

    let (session_id, session) = match body.session_id {
        Some(id) => (id, state.sessions.get(id).await?),
        None => state.sessions.create().await,
    };

    // Place the pricing context into the session's working set.
    let mut url_items: HashMap<String, Uuid> = HashMap::new();
    {
        let mut session = session.lock().await;
        for yaml in &yamls {
            if session
                .context
                .iter()
                .any(|item| item.kind == ItemKind::Yaml && item.value == *yaml)
            {
                continue;
            }
            let item = PricingContextItem::yaml(ItemOrigin::User, yaml.clone(), None)?;
            session.context.insert(item)?;
        }
        for (index, raw) in raw_urls.iter().enumerate() {
            let canonical = CanonicalUrl::parse(raw)?;
            let item_id = match session.context.find_url(canonical.as_str()) {
                Some(existing) => existing.id,
                None => {
                    let origin = if index < provided_count {
                        ItemOrigin::User
                    } else {
                        ItemOrigin::Detected
                    };
                    let mut item = PricingContextItem::url(origin, &canonical);
                    item.transform = TransformState::Pending;
                    session.context.insert(item)?
                }
            };
            url_items.insert(canonical.as_str().to_string(), item_id);
        }
    }

    // Kick transformations off eagerly so `/events` subscribers see
    // completions even when the agent answers without tools. The resolve
    // future is detached; the turn proceeds with whatever is ready.
    for (canonical, item_id) in &url_items {
        let canonical = match CanonicalUrl::parse(canonical) {
            Ok(canonical) => canonical,
            Err(_) => continue,
        };
        let tag = WaiterTag {
            session_id,
            item_id: *item_id,
        };
        let cache = state.cache.clone();
        let session = session.clone();
        let item_id = *item_id;
        tokio::spawn(async move {
            let outcome = cache.resolve(&canonical, tag).await;
            let mut session = session.lock().await;
            if let Some(item) = session.context.get_mut(item_id) {
                match outcome {
                    Ok(_) => item.mark_done(canonical.as_str().to_string()),
                    Err(err) => item.mark_failed(err.to_string()),
                }
            }
        });
    }

    // Pull in any transformation that completed since the previous turn.
    let mut ready_urls: HashMap<String, String> = HashMap::new();
    {
        let mut session = session.lock().await;
        let pending: Vec<(Uuid, String)> = session
            .context
            .iter()
            .filter(|item| item.kind == ItemKind::Url)
            .map(|item| (item.id, item.value.clone()))
            .collect();
        for (item_id, url) in pending {
            if let Ok(canonical) = CanonicalUrl::parse(&url) {
                if let Some(yaml) = state.cache.peek(&canonical).await {
                    if let Some(item) = session.context.get_mut(item_id) {
                        if item.transform != TransformState::Done {
                            item.mark_done(canonical.as_str().to_string());
                        }
                    }
                    ready_urls.insert(canonical.as_str().to_string(), (*yaml).clone());
                }
            }
        }
    }

    let ctx = {
        let session_guard = session.lock().await;
        let mut ctx = ToolContext::new(session_id, session_guard.cancel_token());
        for (alias, content) in session_guard.context.yaml_alias_map() {
            ctx.aliases.insert(alias, content);
        }
        // Ready documents are addressable by their canonical URL too.
        for (canonical, yaml) in &ready_urls {
            ctx.aliases.insert(canonical.clone(), yaml.clone());
        }
        ctx.url_items = url_items.clone();
        let mut references: Vec<String> = url_items.keys().cloned().collect();
        references.extend(
            session_guard
                .context
                .yaml_alias_map()
                .into_iter()
                .map(|(alias, _)| alias),
        );
        if references.len() == 1 {
            ctx.default_reference = references.pop();
        }
        ctx
    };

    info!(session_id = %session_id, urls = url_items.len(), yamls = yamls.len(), "chat turn");
    let outcome = state.agent.run_turn(&session, &question, &ctx).await?;

    Ok(Json(ChatReply {
        session_id,
        answer: outcome.answer,
        plan: outcome.plan,
        result: outcome.result,
    }))
}

/// Query parameters for `GET /events`
#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub session: Uuid,
}

pub async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = state.bus.subscribe(params.session);
    let stream = futures::stream::unfold(subscriber, |mut subscriber| async move {
        match subscriber.recv().await {
            Some(BusMessage::Event(event)) => {
                let data = json!({
                    "id": event.id,
                    "pricing_url": event.pricing_url,
                    "state": event.state,
                    "yaml_content": event.yaml_content,
                    "error": event.error,
                });
                let sse = Event::default()
                    .event("url_transform")
                    .data(data.to_string());
                Some((Ok(sse), subscriber))
            }
            Some(BusMessage::Lagged { skipped }) => {
                warn!(skipped, "SSE subscriber lagged and will be dropped");
                let sse = Event::default()
                    .event("lagged")
                    .data(json!({"skipped": skipped}).to_string());
                Some((Ok(sse), subscriber))
            }
            None => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Response body for `POST /upload`
#[derive(Debug, Serialize)]
pub struct UploadReply {
    pub filename: String,
    pub relative_url: String,
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReply>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(HarveyError::BadRequest {
            message: format!("malformed multipart body: {e}"),
        })
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("pricing.yaml").to_string();
        let content_type = field.content_type().unwrap_or("").to_string();
        let bytes = field.bytes().await.map_err(|e| {
            ApiError(HarveyError::BadRequest {
                message: format!("failed to read upload: {e}"),
            })
        })?;

        let stored = state.blob.put(&filename, &content_type, &bytes).await?;
        return Ok(Json(UploadReply {
            filename: stored.filename,
            relative_url: format!("/static/{}", stored.id),
        }));
    }
    Err(HarveyError::BadRequest {
        message: "multipart field 'file' is required".into(),
    }
    .into())
}

pub async fn delete_pricing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.blob.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_static(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.blob.get(&id).await?;
    Ok(([(header::CONTENT_TYPE, "application/yaml")], bytes))
}

/// Cancel a session's in-flight turn (client disconnect handling for
/// clients that cannot rely on request teardown).
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.sessions.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

fn dedupe(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for value in values {
        if !value.is_empty() && !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

/// Pull pricing URLs out of free-form question text.
fn detect_urls(question: &str) -> Vec<String> {
    static URL_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = URL_PATTERN
        .get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("static pattern compiles"));
    dedupe(pattern.find_iter(question).map(|m| m.as_str().to_string()))
}

/// Periodic session GC plus status bookkeeping, spawned by `serve`.
pub async fn run_session_gc(state: AppState, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let collected = state.sessions.gc_idle().await;
        if collected > 0 {
            info!(collected, "collected idle sessions");
        }
    }
}
