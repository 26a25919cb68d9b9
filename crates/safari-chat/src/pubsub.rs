//! Topic-based fan-out of live snapshots.
//!
//! Each topic owns a refresh function that produces the current snapshot
//! (a conversation's message list, a presence record, a notification feed).
//! `notify` re-runs it and pushes the result to every subscriber in
//! registration order. Snapshots carry a per-topic version, and a subscriber
//! never receives an older version after a newer one.
//!
//! No lock is held while callbacks run, so a callback may unsubscribe itself,
//! subscribe elsewhere, or trigger another `notify`.

use crate::{Clock, ParticipantId, Result};
use rand::Rng;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionError {
    pub message: String,
    /// Consecutive failed refreshes of this topic.
    pub attempt: u32,
    /// When the next refresh will be tried, unix millis.
    pub retry_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent<T> {
    Update(T),
    /// The snapshot could not be refreshed; the topic is retried with backoff
    /// and an `Update` follows once it recovers.
    Error(SubscriptionError),
}

impl<T> SubscriptionEvent<T> {
    pub fn into_update(self) -> Option<T> {
        match self {
            SubscriptionEvent::Update(value) => Some(value),
            SubscriptionEvent::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SubscriptionEvent::Error(_))
    }
}

pub type Callback<T> = Arc<dyn Fn(SubscriptionEvent<T>) + Send + Sync>;
pub type Refresh<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

/// Exponential backoff with up to 25% downward jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms: base_ms.max(1),
            max_ms: max_ms.max(base_ms.max(1)),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        let capped = self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        capped - jitter
    }
}

/// Handle returned by every `subscribe`. Unsubscribing is idempotent and may
/// happen from inside the callback itself.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    active: Arc<AtomicBool>,
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let remove = lock(&self.inner.remove).take();
        if let Some(remove) = remove {
            remove();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

struct Subscriber<T> {
    id: u64,
    viewer: Option<ParticipantId>,
    callback: Callback<T>,
    active: Arc<AtomicBool>,
    delivered_version: Arc<AtomicU64>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            viewer: self.viewer.clone(),
            callback: self.callback.clone(),
            active: self.active.clone(),
            delivered_version: self.delivered_version.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempt: u32,
    retry_at: u64,
}

struct TopicState<T> {
    refresh: Refresh<T>,
    subscribers: Vec<Subscriber<T>>,
    version: u64,
    retry: Option<RetryState>,
}

struct TopicSlot<T> {
    /// Held while a snapshot is produced and versioned, never during delivery.
    sequencer: Mutex<()>,
    state: Mutex<TopicState<T>>,
}

type TopicMap<K, T> = Arc<Mutex<HashMap<K, Arc<TopicSlot<T>>>>>;

pub struct Hub<K, T> {
    name: &'static str,
    topics: TopicMap<K, T>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
}

impl<K, T> Hub<K, T>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(name: &'static str, clock: Arc<dyn Clock>, backoff: Backoff) -> Self {
        Self {
            name,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            clock,
            backoff,
        }
    }

    /// Registers `callback` on `topic` and immediately delivers the current
    /// snapshot to it. `refresh` is only used if the topic has no subscribers yet.
    pub fn subscribe(
        &self,
        topic: K,
        viewer: Option<ParticipantId>,
        refresh: Refresh<T>,
        callback: Callback<T>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            id,
            viewer,
            callback,
            active: active.clone(),
            delivered_version: Arc::new(AtomicU64::new(0)),
        };

        let slot = {
            let mut topics = lock(&self.topics);
            let slot = topics
                .entry(topic.clone())
                .or_insert_with(|| {
                    Arc::new(TopicSlot {
                        sequencer: Mutex::new(()),
                        state: Mutex::new(TopicState {
                            refresh,
                            subscribers: Vec::new(),
                            version: 0,
                            retry: None,
                        }),
                    })
                })
                .clone();
            lock(&slot.state).subscribers.push(subscriber);
            slot
        };
        tracing::debug!(hub = self.name, topic = ?topic, subscriber = id, "subscribed");

        let topics = Arc::downgrade(&self.topics);
        let name = self.name;
        let key = topic.clone();
        let remove = move || {
            let Some(topics) = topics.upgrade() else {
                return;
            };
            let mut topics = lock(&topics);
            let now_empty = match topics.get(&key) {
                Some(slot) => {
                    let mut state = lock(&slot.state);
                    state.subscribers.retain(|s| s.id != id);
                    state.subscribers.is_empty()
                }
                None => false,
            };
            if now_empty {
                topics.remove(&key);
            }
            tracing::debug!(hub = name, topic = ?key, subscriber = id, "unsubscribed");
        };

        let handle = SubscriptionHandle {
            inner: Arc::new(HandleInner {
                active,
                remove: Mutex::new(Some(Box::new(remove))),
            }),
        };

        self.dispatch(&topic, &slot, Some(id));
        handle
    }

    /// Re-reads the topic's snapshot and pushes it to all subscribers.
    pub fn notify(&self, topic: &K) {
        let slot = lock(&self.topics).get(topic).cloned();
        if let Some(slot) = slot {
            self.dispatch(topic, &slot, None);
        }
    }

    /// Re-runs every stale topic whose backoff has elapsed. Returns how many
    /// topics were retried.
    pub fn retry_due(&self) -> usize {
        let now = self.clock.now_millis();
        let due: Vec<(K, Arc<TopicSlot<T>>)> = lock(&self.topics)
            .iter()
            .filter(|(_, slot)| {
                lock(&slot.state)
                    .retry
                    .map(|retry| retry.retry_at <= now)
                    .unwrap_or(false)
            })
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        for (topic, slot) in &due {
            self.dispatch(topic, slot, None);
        }
        due.len()
    }

    pub fn has_viewer(&self, topic: &K, viewer: &ParticipantId) -> bool {
        let slot = lock(&self.topics).get(topic).cloned();
        slot.map(|slot| {
            lock(&slot.state).subscribers.iter().any(|s| {
                s.active.load(Ordering::SeqCst) && s.viewer.as_ref() == Some(viewer)
            })
        })
        .unwrap_or(false)
    }

    pub fn subscriber_count(&self, topic: &K) -> usize {
        let slot = lock(&self.topics).get(topic).cloned();
        slot.map(|slot| lock(&slot.state).subscribers.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }

    pub fn is_stale(&self, topic: &K) -> bool {
        let slot = lock(&self.topics).get(topic).cloned();
        slot.map(|slot| lock(&slot.state).retry.is_some())
            .unwrap_or(false)
    }

    fn dispatch(&self, topic: &K, slot: &TopicSlot<T>, only: Option<u64>) {
        let sequencer = lock(&slot.sequencer);
        let refresh = lock(&slot.state).refresh.clone();
        let result = refresh();

        let (targets, outcome) = {
            let mut state = lock(&slot.state);
            let targets: Vec<Subscriber<T>> = state
                .subscribers
                .iter()
                .filter(|s| only.map(|id| s.id == id).unwrap_or(true))
                .cloned()
                .collect();
            let outcome = match result {
                Ok(value) => {
                    state.version += 1;
                    if only.is_none() {
                        if let Some(retry) = state.retry.take() {
                            tracing::info!(
                                hub = self.name,
                                topic = ?topic,
                                attempts = retry.attempt,
                                "subscription recovered"
                            );
                        }
                    }
                    Ok((state.version, value))
                }
                Err(e) => {
                    let attempt = state.retry.map(|r| r.attempt + 1).unwrap_or(1);
                    let retry_at = self.clock.now_millis() + self.backoff.delay_ms(attempt);
                    state.retry = Some(RetryState { attempt, retry_at });
                    tracing::warn!(
                        hub = self.name,
                        topic = ?topic,
                        attempt,
                        error = %e,
                        "subscription refresh failed"
                    );
                    Err(SubscriptionError {
                        message: e.to_string(),
                        attempt,
                        retry_at,
                    })
                }
            };
            (targets, outcome)
        };
        drop(sequencer);

        match outcome {
            Ok((version, value)) => {
                for subscriber in &targets {
                    if !subscriber.active.load(Ordering::SeqCst) {
                        continue;
                    }
                    if subscriber
                        .delivered_version
                        .fetch_max(version, Ordering::SeqCst)
                        >= version
                    {
                        continue;
                    }
                    invoke(self.name, subscriber, SubscriptionEvent::Update(value.clone()));
                }
            }
            Err(error) => {
                for subscriber in &targets {
                    if subscriber.active.load(Ordering::SeqCst) {
                        invoke(self.name, subscriber, SubscriptionEvent::Error(error.clone()));
                    }
                }
            }
        }
    }
}

fn invoke<T>(hub: &'static str, subscriber: &Subscriber<T>, event: SubscriptionEvent<T>) {
    let callback = &subscriber.callback;
    if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        tracing::warn!(hub, subscriber = subscriber.id, "subscription callback panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
