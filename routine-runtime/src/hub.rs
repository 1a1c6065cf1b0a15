//! Process-local completion notifications.
//!
//! A waiter subscribes for a routine key and hands in a oneshot sink. The
//! sink is resolved either by a direct push from the commit step
//! ([`CompletionHub::notify_completion`]) or by the subscription's own timer,
//! which polls a [`ResultSource`] with a power-law backoff.
//!
//! Subscriptions live in a single map keyed by token and every mutation goes
//! through one lock, so a timer tick, an explicit unsubscribe and a push
//! notification for the same subscription are serialized. Whoever removes
//! the entry first wins; the others find nothing and do nothing.

use crate::error::TransitionError;
use crate::options::HubOptions;
use async_trait::async_trait;
use routine_core::codec::StateCodec;
use routine_core::{RoutineKey, RoutineResult, ServiceId};
use routine_fabric::Fabric;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Somewhere a finished routine's result can be looked up.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch(&self, key: &RoutineKey) -> Result<Option<RoutineResult>, TransitionError>;
}

/// Reads final results from the fabric's record store.
pub struct StoreSource<F, C> {
    fabric: Arc<F>,
    codec: Arc<C>,
}

impl<F, C> StoreSource<F, C> {
    pub fn new(fabric: Arc<F>, codec: Arc<C>) -> Self {
        Self { fabric, codec }
    }
}

#[async_trait]
impl<F, C> ResultSource for StoreSource<F, C>
where
    F: Fabric,
    C: StateCodec,
{
    async fn fetch(&self, key: &RoutineKey) -> Result<Option<RoutineResult>, TransitionError> {
        let Some(record) = self.fabric.try_read(key).await? else {
            return Ok(None);
        };
        match (record.is_complete(), record.result) {
            (true, Some(blob)) => self
                .codec
                .decode::<RoutineResult>(blob)
                .map(Some)
                .map_err(|e| TransitionError::codec("stored result", e)),
            _ => Ok(None),
        }
    }
}

/// Results of routines served over the synchronous-reply channel, as the
/// dispatching side received them.
///
/// A direct reply is usually never stored, so this is the only place a
/// poller can find it. Keys it has not seen go to `fallback`, which covers
/// direct calls that suspended or fell back to the queue. The oldest reply
/// is evicted once `capacity` is reached.
pub struct ReplySource {
    capacity: usize,
    replies: Mutex<Replies>,
    fallback: Option<Arc<dyn ResultSource>>,
}

#[derive(Default)]
struct Replies {
    order: VecDeque<RoutineKey>,
    results: HashMap<RoutineKey, RoutineResult>,
}

impl ReplySource {
    pub fn new(capacity: usize, fallback: Option<Arc<dyn ResultSource>>) -> Self {
        Self {
            capacity: capacity.max(1),
            replies: Mutex::new(Replies::default()),
            fallback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Replies> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the reply a direct call returned for `key`.
    pub fn record(&self, key: &RoutineKey, result: &RoutineResult) {
        let mut replies = self.lock();
        if replies.results.insert(key.clone(), result.clone()).is_none() {
            replies.order.push_back(key.clone());
        }
        while replies.order.len() > self.capacity {
            if let Some(evicted) = replies.order.pop_front() {
                replies.results.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSource for ReplySource {
    async fn fetch(&self, key: &RoutineKey) -> Result<Option<RoutineResult>, TransitionError> {
        let cached = self.lock().results.get(key).cloned();
        match (cached, &self.fallback) {
            (Some(result), _) => Ok(Some(result)),
            (None, Some(fallback)) => fallback.fetch(key).await,
            (None, None) => Ok(None),
        }
    }
}

/// Handle for one subscription. Token 0 is dead and never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub const DEAD: SubscriptionToken = SubscriptionToken(0);

    pub fn is_dead(&self) -> bool {
        self.0 == 0
    }
}

struct TrackedInvocation {
    key: RoutineKey,
    sink: oneshot::Sender<RoutineResult>,
    /// Chosen once at subscribe time.
    source: Option<Arc<dyn ResultSource>>,
    polls: u32,
    timer: Option<JoinHandle<()>>,
}

struct Tracked {
    next_token: u64,
    invocations: HashMap<u64, TrackedInvocation>,
}

struct HubInner {
    options: HubOptions,
    store: Option<Arc<dyn ResultSource>>,
    sources: HashMap<ServiceId, Arc<dyn ResultSource>>,
    replies: Option<Arc<ReplySource>>,
    tracked: Mutex<Tracked>,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A service-specific source if one is registered, else the store.
    fn source_for(&self, key: &RoutineKey) -> Option<Arc<dyn ResultSource>> {
        self.sources
            .get(&key.service)
            .or(self.store.as_ref())
            .cloned()
    }

    /// Remove a subscription and resolve its sink. No-op if it is gone.
    /// Called from the subscription's own timer, which is left running.
    fn finish(&self, token: u64, result: RoutineResult) {
        let Some(tracked) = self.lock().invocations.remove(&token) else {
            return;
        };
        // The waiter may have gone away; that is not an error.
        let _ = tracked.sink.send(result);
    }
}

/// Lets local waiters learn that a routine finished.
#[derive(Clone)]
pub struct CompletionHub {
    inner: Arc<HubInner>,
}

impl Default for CompletionHub {
    fn default() -> Self {
        Self::new(HubOptions::default())
    }
}

impl CompletionHub {
    /// A hub that only learns results by push.
    pub fn new(options: HubOptions) -> Self {
        Self::build(options, None, HashMap::new(), None)
    }

    /// A hub that falls back to polling `store` for every service.
    pub fn with_store(options: HubOptions, store: Arc<dyn ResultSource>) -> Self {
        Self::build(options, Some(store), HashMap::new(), None)
    }

    fn build(
        options: HubOptions,
        store: Option<Arc<dyn ResultSource>>,
        sources: HashMap<ServiceId, Arc<dyn ResultSource>>,
        replies: Option<Arc<ReplySource>>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                options,
                store,
                sources,
                replies,
                tracked: Mutex::new(Tracked {
                    next_token: 1,
                    invocations: HashMap::new(),
                }),
            }),
        }
    }

    /// Prefer `source` over the store for routines of `service`.
    ///
    /// Must be called before the hub is shared.
    #[must_use]
    pub fn with_source(self, service: impl Into<String>, source: Arc<dyn ResultSource>) -> Self {
        let mut sources = self.inner.sources.clone();
        sources.insert(ServiceId::new(service), source);
        Self::build(
            self.inner.options.clone(),
            self.inner.store.clone(),
            sources,
            self.inner.replies.clone(),
        )
    }

    /// Answer lookups for `services` from `replies`, which
    /// [`deliver_reply`](Self::deliver_reply) fills.
    ///
    /// Must be called before the hub is shared.
    #[must_use]
    pub fn with_direct_replies<I>(self, services: I, replies: Arc<ReplySource>) -> Self
    where
        I: IntoIterator<Item = ServiceId>,
    {
        let mut sources = self.inner.sources.clone();
        for service in services {
            sources.insert(service, Arc::clone(&replies) as Arc<dyn ResultSource>);
        }
        Self::build(
            self.inner.options.clone(),
            self.inner.store.clone(),
            sources,
            Some(replies),
        )
    }

    pub fn options(&self) -> &HubOptions {
        &self.inner.options
    }

    /// Register interest in the result of `key`.
    ///
    /// Returns [`SubscriptionToken::DEAD`] without registering anything if
    /// `cancel` is already signaled; the sink is dropped in that case.
    /// Cancelling later removes the subscription.
    pub fn subscribe(
        &self,
        key: RoutineKey,
        sink: oneshot::Sender<RoutineResult>,
        cancel: &CancellationToken,
    ) -> SubscriptionToken {
        if cancel.is_cancelled() {
            return SubscriptionToken::DEAD;
        }

        let source = self.inner.source_for(&key);
        let mut tracked = self.inner.lock();
        let token = tracked.next_token;
        tracked.next_token += 1;

        let timer = tokio::spawn(Self::watch(
            Arc::downgrade(&self.inner),
            token,
            source.clone(),
            cancel.clone(),
        ));

        tracing::trace!(key = %key, token, "Subscribed to completion");
        tracked.invocations.insert(
            token,
            TrackedInvocation {
                key,
                sink,
                source,
                polls: 0,
                timer: Some(timer),
            },
        );
        SubscriptionToken(token)
    }

    /// Register interest and get the receiving end back.
    pub fn subscribe_channel(
        &self,
        key: RoutineKey,
        cancel: &CancellationToken,
    ) -> (SubscriptionToken, oneshot::Receiver<RoutineResult>) {
        let (sink, receiver) = oneshot::channel();
        (self.subscribe(key, sink, cancel), receiver)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let removed = self.inner.lock().invocations.remove(&token.0);
        if let Some(tracked) = removed
            && let Some(timer) = tracked.timer
        {
            timer.abort();
        }
    }

    /// Resolve every subscription for `key`. Returns how many were resolved.
    pub fn notify_completion(&self, key: &RoutineKey, result: &RoutineResult) -> usize {
        let matched: Vec<TrackedInvocation> = {
            let mut tracked = self.inner.lock();
            let tokens: Vec<u64> = tracked
                .invocations
                .iter()
                .filter(|(_, t)| &t.key == key)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| tracked.invocations.remove(&token))
                .collect()
        };

        let count = matched.len();
        for tracked in matched {
            if let Some(timer) = tracked.timer {
                timer.abort();
            }
            let _ = tracked.sink.send(result.clone());
        }
        if count > 0 {
            tracing::debug!(key = %key, subscribers = count, "Notified local subscribers");
        }
        count
    }

    /// Hand over the reply of a call served over the synchronous-reply
    /// channel: keep it for later lookups, then notify like a completion.
    pub fn deliver_reply(&self, key: &RoutineKey, result: &RoutineResult) -> usize {
        if let Some(replies) = &self.inner.replies {
            replies.record(key, result);
        }
        self.notify_completion(key, result)
    }

    /// Look up a result once, through the source an existing subscription
    /// for `key` uses or else the one a new subscription would use.
    pub async fn poll_once(
        &self,
        key: &RoutineKey,
    ) -> Result<Option<RoutineResult>, TransitionError> {
        let existing = {
            let tracked = self.inner.lock();
            tracked
                .invocations
                .values()
                .find(|t| &t.key == key)
                .map(|t| t.source.clone())
        };
        match existing.unwrap_or_else(|| self.inner.source_for(key)) {
            Some(source) => source.fetch(key).await,
            None => Ok(None),
        }
    }

    /// Number of live subscriptions.
    pub fn tracked(&self) -> usize {
        self.inner.lock().invocations.len()
    }

    /// Timer for one subscription: polls its source with backoff until a
    /// result shows up, the subscription disappears or `cancel` fires.
    async fn watch(
        hub: Weak<HubInner>,
        token: u64,
        source: Option<Arc<dyn ResultSource>>,
        cancel: CancellationToken,
    ) {
        let Some(source) = source else {
            cancel.cancelled().await;
            if let Some(hub) = hub.upgrade() {
                hub.lock().invocations.remove(&token);
            }
            return;
        };

        let mut delay = match hub.upgrade() {
            Some(hub) => hub.options.first_poll_delay,
            None => return,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(hub) = hub.upgrade() {
                        hub.lock().invocations.remove(&token);
                    }
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(inner) = hub.upgrade() else {
                return;
            };
            let Some(key) = inner.lock().invocations.get(&token).map(|t| t.key.clone()) else {
                return;
            };

            match source.fetch(&key).await {
                Ok(Some(result)) => {
                    inner.finish(token, result);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Completion poll failed");
                }
            }

            let polls = {
                let mut tracked = inner.lock();
                let Some(entry) = tracked.invocations.get_mut(&token) else {
                    return;
                };
                entry.polls += 1;
                entry.polls
            };
            delay = inner.options.poll_interval(polls);
            tracing::trace!(key = %key, polls, next_poll = ?delay, "Result not ready");
        }
    }
}
