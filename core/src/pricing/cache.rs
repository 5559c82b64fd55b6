//! Pricing-context cache
//!
//! URL → YAML store in front of the extractor with single-flight semantics:
//! at most one transformation is in flight per canonical URL, concurrent
//! requesters attach as waiters to the shared flight and all observe the
//! same outcome. Ready entries expire lazily by wall-clock TTL; failed
//! entries block retries for a cool-down; capacity is bounded by LRU
//! eviction. Every terminal transition is published to the notification bus
//! once per attached waiter, scoped to that waiter's session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::CanonicalUrl;
use crate::bus::{NotificationBus, TransformPhase, UrlTransformEvent};
use crate::config::CacheSettings;
use crate::error::{HarveyError, Result};

/// Seam to the extractor service; implemented by the A-MINT adapter in
/// production and by spies in tests.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn transform(&self, url: &CanonicalUrl) -> Result<String>;
}

/// Shared result of one transformation attempt
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    Ready(Arc<String>),
    Failed(HarveyError),
}

/// Identifies one waiter for notification purposes
#[derive(Debug, Clone, Copy)]
pub struct WaiterTag {
    pub session_id: Uuid,
    pub item_id: Uuid,
}

enum EntryState {
    InFlight {
        notify: broadcast::Sender<TransformOutcome>,
        waiters: Vec<WaiterTag>,
    },
    Ready {
        yaml: Arc<String>,
        fetched_at: DateTime<Utc>,
    },
    Error {
        cause: HarveyError,
        at: DateTime<Utc>,
    },
}

struct Entry {
    state: EntryState,
    last_access: DateTime<Utc>,
}

/// Single-flight transformation cache
pub struct PricingCache {
    entries: Mutex<HashMap<CanonicalUrl, Entry>>,
    extractor: Arc<dyn Extractor>,
    bus: NotificationBus,
    settings: CacheSettings,
}

impl PricingCache {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        bus: NotificationBus,
        settings: CacheSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            extractor,
            bus,
            settings,
        })
    }

    /// Resolve a canonical URL to its YAML, transforming it if necessary.
    ///
    /// Dropping the returned future detaches this waiter only; an in-flight
    /// transformation keeps running for the remaining waiters.
    pub async fn resolve(self: &Arc<Self>, url: &CanonicalUrl, tag: WaiterTag) -> Result<Arc<String>> {
        enum Plan {
            Hit(Arc<String>),
            CachedError(HarveyError),
            Await(broadcast::Receiver<TransformOutcome>),
        }

        let plan = {
            let mut entries = self.entries.lock().await;
            let now = Utc::now();

            // Classify the entry without starting anything yet; expired
            // ready entries and cooled-down errors fall through to a fresh
            // flight.
            let classified = match entries.get_mut(url) {
                Some(entry) => {
                    entry.last_access = now;
                    match &mut entry.state {
                        EntryState::Ready { yaml, fetched_at }
                            if age_within(*fetched_at, now, self.settings.ttl) =>
                        {
                            debug!(url = %url, "pricing cache hit");
                            Some(Plan::Hit(yaml.clone()))
                        }
                        EntryState::InFlight { notify, waiters } => {
                            // One notification per (session, item), however
                            // many times that waiter re-attaches.
                            if !waiters.iter().any(|w| {
                                w.session_id == tag.session_id && w.item_id == tag.item_id
                            }) {
                                waiters.push(tag);
                            }
                            Some(Plan::Await(notify.subscribe()))
                        }
                        EntryState::Error { cause, at }
                            if age_within(*at, now, self.settings.error_cooldown) =>
                        {
                            debug!(url = %url, "pricing cache error within cool-down");
                            Some(Plan::CachedError(cause.clone()))
                        }
                        _ => None,
                    }
                }
                None => None,
            };

            match classified {
                Some(plan) => plan,
                None => {
                    info!(url = %url, "pricing cache miss, starting transformation");
                    let (notify, receiver) = broadcast::channel(8);
                    entries.insert(
                        url.clone(),
                        Entry {
                            state: EntryState::InFlight {
                                notify,
                                waiters: vec![tag],
                            },
                            last_access: now,
                        },
                    );
                    self.evict_over_capacity(&mut entries);

                    let cache = self.clone();
                    let flight_url = url.clone();
                    tokio::spawn(async move {
                        cache.drive_flight(flight_url).await;
                    });
                    Plan::Await(receiver)
                }
            }
        };

        match plan {
            Plan::Hit(yaml) => Ok(yaml),
            Plan::CachedError(cause) => Err(cause),
            Plan::Await(receiver) => await_outcome(receiver).await,
        }
    }

    /// Drop a settled entry so the next resolve re-extracts. An in-flight
    /// entry is left alone; its waiters keep their shared outcome.
    pub async fn invalidate(&self, url: &CanonicalUrl) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(url) {
            if !matches!(entry.state, EntryState::InFlight { .. }) {
                entries.remove(url);
                debug!(url = %url, "pricing cache entry invalidated");
            }
        }
    }

    /// Non-blocking view of a fresh ready entry. Used to pull in
    /// transformations that completed after the turn that requested them.
    pub async fn peek(&self, url: &CanonicalUrl) -> Option<Arc<String>> {
        let entries = self.entries.lock().await;
        match entries.get(url) {
            Some(Entry {
                state: EntryState::Ready { yaml, fetched_at },
                ..
            }) if age_within(*fetched_at, Utc::now(), self.settings.ttl) => Some(yaml.clone()),
            _ => None,
        }
    }

    /// Run one transformation attempt to completion and fan the result out.
    async fn drive_flight(self: Arc<Self>, url: CanonicalUrl) {
        let outcome = match tokio::time::timeout(
            self.settings.transform_timeout,
            self.extractor.transform(&url),
        )
        .await
        {
            Ok(Ok(yaml)) => TransformOutcome::Ready(Arc::new(yaml)),
            Ok(Err(err)) => TransformOutcome::Failed(err),
            Err(_) => TransformOutcome::Failed(HarveyError::Timeout {
                duration: self.settings.transform_timeout,
            }),
        };

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&url) else {
            warn!(url = %url, "cache entry vanished mid-flight");
            return;
        };
        let (notify, waiters) = match std::mem::replace(
            &mut entry.state,
            next_state(&outcome),
        ) {
            EntryState::InFlight { notify, waiters } => (notify, waiters),
            other => {
                // A flight result landed on a non-in-flight entry; restore
                // and bail rather than clobber state.
                entry.state = other;
                warn!(url = %url, "dropping flight result for non-in-flight entry");
                return;
            }
        };
        drop(entries);

        for waiter in &waiters {
            self.bus.publish(transform_event(waiter, &url, &outcome));
        }
        let _ = notify.send(outcome);
    }

    /// Drop least-recently-accessed settled entries over capacity.
    fn evict_over_capacity(&self, entries: &mut HashMap<CanonicalUrl, Entry>) {
        while entries.len() > self.settings.max_entries {
            let victim = entries
                .iter()
                .filter(|(_, entry)| !matches!(entry.state, EntryState::InFlight { .. }))
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(url, _)| url.clone());
            match victim {
                Some(url) => {
                    debug!(url = %url, "evicting pricing cache entry");
                    entries.remove(&url);
                }
                None => break,
            }
        }
    }
}

fn next_state(outcome: &TransformOutcome) -> EntryState {
    match outcome {
        TransformOutcome::Ready(yaml) => EntryState::Ready {
            yaml: yaml.clone(),
            fetched_at: Utc::now(),
        },
        TransformOutcome::Failed(cause) => EntryState::Error {
            cause: cause.clone(),
            at: Utc::now(),
        },
    }
}

fn transform_event(
    waiter: &WaiterTag,
    url: &CanonicalUrl,
    outcome: &TransformOutcome,
) -> UrlTransformEvent {
    match outcome {
        TransformOutcome::Ready(yaml) => UrlTransformEvent {
            session_id: waiter.session_id,
            id: waiter.item_id,
            pricing_url: url.as_str().to_string(),
            state: TransformPhase::Done,
            yaml_content: Some(yaml.as_str().to_string()),
            error: None,
        },
        TransformOutcome::Failed(cause) => UrlTransformEvent {
            session_id: waiter.session_id,
            id: waiter.item_id,
            pricing_url: url.as_str().to_string(),
            state: TransformPhase::Failed,
            yaml_content: None,
            error: Some(cause.to_string()),
        },
    }
}

fn age_within(since: DateTime<Utc>, now: DateTime<Utc>, limit: std::time::Duration) -> bool {
    let age = now.signed_duration_since(since);
    match chrono::Duration::from_std(limit) {
        Ok(limit) => age < limit,
        Err(_) => true,
    }
}

async fn await_outcome(
    mut receiver: broadcast::Receiver<TransformOutcome>,
) -> Result<Arc<String>> {
    match receiver.recv().await {
        Ok(TransformOutcome::Ready(yaml)) => Ok(yaml),
        Ok(TransformOutcome::Failed(cause)) => Err(cause),
        Err(_) => Err(HarveyError::internal(
            "transformation flight ended without a result",
        )),
    }
}
