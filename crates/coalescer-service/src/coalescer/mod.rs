//! The [`Coalescer`] ties together caching, deduplication, batching, retries and the offline
//! queue.
//!
//! All mutable state lives in a single `State` behind a mutex, which is never held across an
//! `.await`. Executions run in spawned tasks, so a caller dropping its [`RequestHandle`] does not
//! abort an execution that other callers may be waiting on.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchScheduler, Enqueued};
use crate::cache_key::RequestKey;
use crate::caching::CacheStore;
use crate::config::CoalescerConfig;
use crate::connectivity::Connectivity;
use crate::dedup::{Claim, Deduplicator, Shared, SharedOutcome};
use crate::error::CoalescerError;
use crate::executor::{Executor, HttpExecutor};
use crate::offline::OfflineQueue;
use crate::retry::{Attempted, RetryEngine, RetryPolicy};
use crate::stats::{CoalescerMetrics, MetricsCollector};
use crate::types::{
    BatchEntryResult, BatchId, BatchResponse, CoalescedResponse, RequestBatch, RequestConfig,
    RequestId, TrackedRequest,
};
use crate::utils::defer::defer;

mod callbacks;

pub use callbacks::*;

type Responder = oneshot::Sender<Result<CoalescedResponse, CoalescerError>>;

/// How a live request relates to the deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Executes, and holds the dedup key for its followers.
    Owner,
    /// Executes without taking part in deduplication.
    Independent,
    /// Waits for the outcome of an owner.
    Follower,
}

#[derive(Debug)]
struct Entry {
    tracked: TrackedRequest,
    key: RequestKey,
    role: Role,
    responder: Option<Responder>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct OfflineEntry {
    tracked: TrackedRequest,
    responder: Responder,
}

#[derive(Debug)]
struct State {
    cache: CacheStore<RequestKey, Value>,
    dedup: Deduplicator,
    scheduler: BatchScheduler,
    offline: OfflineQueue<OfflineEntry>,
    /// Every non-terminal request that is not in the offline queue.
    requests: HashMap<RequestId, Entry>,
    /// Snapshots of recently finished requests, oldest first.
    history: VecDeque<TrackedRequest>,
    history_size: usize,
    metrics: MetricsCollector,
}

impl State {
    fn new(config: &CoalescerConfig) -> Self {
        Self {
            cache: CacheStore::new(config.max_cache_entries),
            dedup: Deduplicator::new(config.deduplication_window),
            scheduler: BatchScheduler::new(config.max_batch_size, config.batch_window),
            offline: OfflineQueue::new(config.max_offline_queue_size),
            requests: HashMap::new(),
            history: VecDeque::new(),
            history_size: config.request_history_size,
            metrics: MetricsCollector::new(),
        }
    }

    fn pending(&self) -> usize {
        self.requests.len() + self.offline.len()
    }

    fn remember(&mut self, tracked: TrackedRequest) {
        if self.history_size == 0 {
            return;
        }
        if self.history.len() >= self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(tracked);
    }

    fn lookup(&self, id: RequestId) -> Option<TrackedRequest> {
        if let Some(entry) = self.requests.get(&id) {
            return Some(entry.tracked.clone());
        }
        if let Some(entry) = self.offline.get(id) {
            return Some(entry.tracked.clone());
        }
        self.history.iter().rev().find(|t| t.id == id).cloned()
    }

    /// Transitions a removed entry to cancelled and notifies its waiters.
    ///
    /// Cancelling an owner cancels its followers along with it.
    fn cancel_entry(&mut self, mut entry: Entry, events: &mut Vec<Event>) -> TrackedRequest {
        let id = entry.tracked.id;
        entry.cancel.cancel();
        self.scheduler.remove(id);
        let followers = match entry.role {
            Role::Owner => self.dedup.reject(&entry.key, id, CoalescerError::Cancelled),
            Role::Follower => {
                self.dedup.detach(&entry.key, id);
                Vec::new()
            }
            Role::Independent => Vec::new(),
        };

        entry.tracked.cancel();
        self.metrics.record_cancellation();
        if let Some(responder) = entry.responder.take() {
            responder.send(Err(CoalescerError::Cancelled)).ok();
        }
        tracing::debug!(request_id = %id, "Request cancelled");

        self.remember(entry.tracked.clone());
        events.push(Event::Failed(
            entry.tracked.clone(),
            CoalescerError::Cancelled,
        ));

        for follower in followers {
            if let Some(follower) = self.requests.remove(&follower) {
                self.cancel_entry(follower, events);
            }
        }
        entry.tracked
    }

    fn cancel_offline(&mut self, mut entry: OfflineEntry, events: &mut Vec<Event>) {
        entry.tracked.cancel();
        self.metrics.record_cancellation();
        entry.responder.send(Err(CoalescerError::Cancelled)).ok();

        self.remember(entry.tracked.clone());
        events.push(Event::Failed(entry.tracked, CoalescerError::Cancelled));
    }

    /// Transitions a removed entry to failed and notifies its waiters.
    fn fail_entry(
        &mut self,
        mut entry: Entry,
        error: CoalescerError,
        events: &mut Vec<Event>,
    ) -> TrackedRequest {
        let id = entry.tracked.id;
        if entry.role == Role::Owner {
            self.dedup.reject(&entry.key, id, error.clone());
        }

        entry.tracked.fail(error.clone());
        self.metrics.record_failure(&error);
        if let Some(responder) = entry.responder.take() {
            responder.send(Err(error.clone())).ok();
        }
        tracing::debug!(request_id = %id, %error, "Request failed");

        self.remember(entry.tracked.clone());
        events.push(Event::Failed(entry.tracked.clone(), error));
        entry.tracked
    }
}

struct Inner {
    config: CoalescerConfig,
    executor: Arc<dyn Executor>,
    retry: RetryEngine,
    callbacks: Callbacks,
    connectivity: Connectivity,
    /// Parent of every request's cancellation token.
    shutdown: CancellationToken,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(state) = self.state.get_mut() {
            state.scheduler.cancel_timer();
            state.dedup.reject_all(CoalescerError::Cancelled);
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn next_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Runs a request through cache, deduplication and scheduling.
    fn submit(self: &Arc<Self>, tracked: TrackedRequest, responder: Responder) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            self.submit_locked(&mut state, tracked, responder, &mut events);
        }
        self.callbacks.emit(events);
    }

    fn submit_locked(
        self: &Arc<Self>,
        state: &mut State,
        mut tracked: TrackedRequest,
        responder: Responder,
        events: &mut Vec<Event>,
    ) {
        let id = tracked.id;
        let key = RequestKey::for_request(&tracked.config);

        if self.config.enable_cache {
            let hit = state.cache.get(&key);
            state.metrics.record_cache_lookup(hit.is_some());
            if let Some(data) = hit {
                tracing::trace!(request_id = %id, %key, "Serving request from cache");
                tracked.complete(data.clone());
                let response = CoalescedResponse {
                    data,
                    from_cache: true,
                    coalesced_count: 0,
                    batch_id: None,
                    latency: tracked.created_at.elapsed(),
                };
                responder.send(Ok(response)).ok();
                state.remember(tracked.clone());
                events.push(Event::Completed(tracked));
                return;
            }
        }

        let role = if tracked.config.deduplicate {
            match state.dedup.claim(&key, id) {
                Claim::Owner => Role::Owner,
                Claim::Follower(receiver) => {
                    state.metrics.record_coalesced();
                    self.spawn_follower(id, receiver);
                    Role::Follower
                }
            }
        } else {
            Role::Independent
        };

        let priority = tracked.config.priority;
        let batchable = tracked.config.batchable;
        state.requests.insert(
            id,
            Entry {
                tracked,
                key,
                role,
                responder: Some(responder),
                cancel: self.shutdown.child_token(),
            },
        );

        if role == Role::Follower {
            return;
        }

        if !batchable {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.execute_request(id).await;
            });
            return;
        }

        match state.scheduler.enqueue(id, priority) {
            Enqueued::ArmTimer(generation) => self.spawn_timer(state, generation),
            Enqueued::Full => {
                self.flush_locked(state);
            }
            Enqueued::Queued => {}
        }
    }

    fn spawn_follower(
        self: &Arc<Self>,
        id: RequestId,
        receiver: oneshot::Receiver<SharedOutcome>,
    ) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = receiver.await;
            if let Some(inner) = inner.upgrade() {
                inner.finish_follower(id, outcome);
            }
        });
    }

    fn spawn_timer(self: &Arc<Self>, state: &mut State, generation: u64) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let window = state.scheduler.window();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                inner.window_elapsed(generation);
            }
        });
        state.scheduler.attach_timer(generation, task.abort_handle());
    }

    fn window_elapsed(self: &Arc<Self>, generation: u64) {
        let mut state = self.state();
        if state.scheduler.timer_fired(generation) {
            self.flush_locked(&mut state);
        }
    }

    /// Closes the current batch window and dispatches its requests.
    fn flush_locked(self: &Arc<Self>, state: &mut State) -> Option<BatchId> {
        let ids = state.scheduler.close();
        if let Some(generation) = state.scheduler.arm() {
            self.spawn_timer(state, generation);
        }
        if ids.is_empty() {
            return None;
        }

        let batch_id = BatchId::new();
        state.metrics.record_batch(ids.len());

        let mut requests = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entry) = state.requests.get_mut(id) {
                entry.tracked.batch_id = Some(batch_id);
                requests.push(entry.tracked.clone());
            }
        }
        let batch = RequestBatch {
            id: batch_id,
            requests,
            created_at: Instant::now(),
        };
        tracing::debug!(%batch_id, size = ids.len(), "Dispatching batch");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.callbacks.batch_started(&batch);

            // `join_all` polls in order, so attempts start in priority order
            let finished = join_all(ids.iter().map(|id| inner.execute_request(*id))).await;

            let batch = RequestBatch {
                requests: finished.into_iter().flatten().collect(),
                ..batch
            };
            inner.callbacks.batch_completed(&batch);
        });

        Some(batch_id)
    }

    /// Executes a scheduled request, returning its final state.
    async fn execute_request(self: &Arc<Self>, id: RequestId) -> Option<TrackedRequest> {
        let (started, cancel) = {
            let mut state = self.state();
            let Some(entry) = state.requests.get_mut(&id) else {
                // cancelled while waiting for its batch
                return state.lookup(id);
            };
            entry.tracked.start();
            (entry.tracked.clone(), entry.cancel.clone())
        };
        self.callbacks.request_started(&started);
        tracing::trace!(
            request_id = %id,
            endpoint = %started.config.endpoint,
            "Executing request"
        );

        let guard = defer(|| {
            self.cancel(id);
        });
        let attempted = self
            .retry
            .execute(&*self.executor, &started.config, &cancel)
            .await;
        guard.disarm();

        self.finish(id, attempted)
    }

    /// Settles an executed request, returning its final state.
    fn finish(&self, id: RequestId, attempted: Attempted) -> Option<TrackedRequest> {
        let mut events = Vec::new();
        let finished = {
            let mut state = self.state();
            state
                .metrics
                .record_attempts(attempted.retries, attempted.timeouts);

            if let Some(mut entry) = state.requests.remove(&id) {
                entry.tracked.retry_count = attempted.retries;
                Some(match attempted.result {
                    Ok(data) => self.complete_entry(&mut state, entry, data, &mut events),
                    Err(CoalescerError::Cancelled) => state.cancel_entry(entry, &mut events),
                    Err(error) => state.fail_entry(entry, error, &mut events),
                })
            } else {
                // cancelled while executing
                state.lookup(id)
            }
        };
        self.callbacks.emit(events);
        finished
    }

    fn complete_entry(
        &self,
        state: &mut State,
        mut entry: Entry,
        data: Value,
        events: &mut Vec<Event>,
    ) -> TrackedRequest {
        let id = entry.tracked.id;
        if self.config.enable_cache {
            state
                .cache
                .put(entry.key.clone(), data.clone(), self.config.cache_ttl);
        }

        let batch_id = entry.tracked.batch_id;
        let coalesced_count = match entry.role {
            Role::Owner => state.dedup.resolve(
                &entry.key,
                id,
                Shared {
                    data: data.clone(),
                    batch_id,
                    coalesced_count: 0,
                },
            ),
            _ => 0,
        };

        entry.tracked.complete(data.clone());
        let latency = entry.tracked.latency().unwrap_or_default();
        state.metrics.record_completion(latency);
        if let Some(responder) = entry.responder.take() {
            let response = CoalescedResponse {
                data,
                from_cache: false,
                coalesced_count,
                batch_id,
                latency,
            };
            responder.send(Ok(response)).ok();
        }
        tracing::trace!(request_id = %id, coalesced_count, "Request completed");

        state.remember(entry.tracked.clone());
        events.push(Event::Completed(entry.tracked.clone()));
        entry.tracked
    }

    fn finish_follower(
        &self,
        id: RequestId,
        outcome: Result<SharedOutcome, oneshot::error::RecvError>,
    ) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            let Some(mut entry) = state.requests.remove(&id) else {
                return;
            };
            match outcome {
                Ok(Ok(shared)) => {
                    entry.tracked.batch_id = shared.batch_id;
                    entry.tracked.complete(shared.data.clone());
                    if let Some(responder) = entry.responder.take() {
                        let response = CoalescedResponse {
                            data: shared.data,
                            from_cache: false,
                            coalesced_count: shared.coalesced_count,
                            batch_id: shared.batch_id,
                            latency: entry.tracked.latency().unwrap_or_default(),
                        };
                        responder.send(Ok(response)).ok();
                    }
                    state.remember(entry.tracked.clone());
                    events.push(Event::Completed(entry.tracked));
                }
                Ok(Err(CoalescerError::Cancelled)) | Err(_) => {
                    state.cancel_entry(entry, &mut events);
                }
                Ok(Err(error)) => {
                    state.fail_entry(entry, error, &mut events);
                }
            }
        }
        self.callbacks.emit(events);
    }

    /// Holds a request back while offline, or submits it if connectivity came back meanwhile.
    fn enqueue_offline(self: &Arc<Self>, tracked: TrackedRequest, responder: Responder) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            // connectivity only changes under the state lock
            if self.connectivity.is_online() {
                self.submit_locked(&mut state, tracked, responder, &mut events);
                drop(state);
                self.callbacks.emit(events);
                return;
            }

            let before = state.offline.len();
            let id = tracked.id;
            tracing::debug!(request_id = %id, "Queueing request while offline");

            if let Some((evicted, mut entry)) =
                state.offline.push(id, OfflineEntry { tracked, responder })
            {
                tracing::warn!(
                    request_id = %evicted,
                    "Offline queue is full, dropping oldest request"
                );
                let error = CoalescerError::OfflineQueueFull;
                entry.tracked.fail(error.clone());
                state.metrics.record_failure(&error);
                entry.responder.send(Err(error.clone())).ok();
                state.remember(entry.tracked.clone());
                events.push(Event::Failed(entry.tracked, error));
            }

            let after = state.offline.len();
            if after != before {
                events.push(Event::OfflineQueueChanged(after));
            }
        }
        self.callbacks.emit(events);
    }

    fn flush_offline(self: &Arc<Self>) -> usize {
        let entries = {
            let mut state = self.state();
            state.offline.drain()
        };
        if entries.is_empty() {
            return 0;
        }
        tracing::debug!(count = entries.len(), "Flushing offline queue");
        self.callbacks.emit(vec![Event::OfflineQueueChanged(0)]);

        let count = entries.len();
        for (_, entry) in entries {
            self.submit(entry.tracked, entry.responder);
        }
        count
    }

    fn cancel(&self, id: RequestId) -> bool {
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state();
            if let Some(entry) = state.requests.remove(&id) {
                state.cancel_entry(entry, &mut events);
                true
            } else if let Some(entry) = state.offline.remove(id) {
                state.cancel_offline(entry, &mut events);
                let len = state.offline.len();
                events.push(Event::OfflineQueueChanged(len));
                true
            } else {
                false
            }
        };
        self.callbacks.emit(events);
        cancelled
    }

    fn cancel_all(&self) -> usize {
        let mut events = Vec::new();
        let count = {
            let mut state = self.state();
            state.scheduler.cancel_timer();

            let mut ids: Vec<_> = state.requests.keys().copied().collect();
            ids.sort_unstable();
            for id in &ids {
                // cancelling an owner also removes its followers
                if let Some(entry) = state.requests.remove(id) {
                    state.cancel_entry(entry, &mut events);
                }
            }

            let offline = state.offline.drain();
            let count = ids.len() + offline.len();
            if !offline.is_empty() {
                for (_, entry) in offline {
                    state.cancel_offline(entry, &mut events);
                }
                events.push(Event::OfflineQueueChanged(0));
            }
            count
        };
        if count > 0 {
            tracing::debug!(count, "Cancelled all requests");
        }
        self.callbacks.emit(events);
        count
    }
}

/// A submitted request.
///
/// Resolves to the response of the request. If the request is cancelled, or the coalescer is
/// dropped before the request finished, this resolves to [`CoalescerError::Cancelled`].
/// Dropping the handle does not cancel the request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Result<CoalescedResponse, CoalescerError>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for RequestHandle {
    type Output = Result<CoalescedResponse, CoalescerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoalescerError::Cancelled)))
    }
}

/// Configures and creates a [`Coalescer`].
pub struct CoalescerBuilder {
    config: CoalescerConfig,
    executor: Option<Arc<dyn Executor>>,
    callbacks: Callbacks,
    online: bool,
}

impl std::fmt::Debug for CoalescerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescerBuilder")
            .field("config", &self.config)
            .field("custom_executor", &self.executor.is_some())
            .field("callbacks", &self.callbacks)
            .field("online", &self.online)
            .finish()
    }
}

impl CoalescerBuilder {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            config,
            executor: None,
            callbacks: Callbacks::default(),
            online: true,
        }
    }

    /// Replaces the default [`HttpExecutor`].
    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the initial connectivity, which defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn build(self) -> Coalescer {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(HttpExecutor::default()));

        Coalescer {
            inner: Arc::new(Inner {
                retry: RetryEngine::new(RetryPolicy::from_config(&self.config)),
                state: Mutex::new(State::new(&self.config)),
                config: self.config,
                executor,
                callbacks: self.callbacks,
                connectivity: Connectivity::new(self.online),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Coalesces, batches, caches and retries requests to an [`Executor`].
///
/// The coalescer is cheap to clone; clones share all state. All operations have to be called
/// from within a tokio runtime.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("config", &self.inner.config)
            .field("online", &self.is_online())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Coalescer {
    /// Creates a coalescer executing requests over HTTP.
    pub fn new(config: CoalescerConfig) -> Self {
        CoalescerBuilder::new(config).build()
    }

    pub fn builder(config: CoalescerConfig) -> CoalescerBuilder {
        CoalescerBuilder::new(config)
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.inner.config
    }

    /// Submits a request and returns a handle resolving to its response.
    ///
    /// Invalid requests, and requests submitted after [`shutdown`](Self::shutdown), are
    /// rejected right away. While offline, the request is held in the offline queue.
    pub fn submit(&self, config: RequestConfig) -> Result<RequestHandle, CoalescerError> {
        self.inner.state().metrics.record_request();

        config.validate()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(CoalescerError::ShutDown);
        }

        let id = self.inner.next_id();
        let tracked = TrackedRequest::new(id, config);
        let (responder, receiver) = oneshot::channel();

        if self.inner.config.enable_offline_queue && !self.inner.connectivity.is_online() {
            self.inner.enqueue_offline(tracked, responder);
        } else {
            self.inner.submit(tracked, responder);
        }

        Ok(RequestHandle { id, receiver })
    }

    /// Submits a request and waits for its response.
    pub async fn request(
        &self,
        config: RequestConfig,
    ) -> Result<CoalescedResponse, CoalescerError> {
        self.submit(config)?.await
    }

    /// Submits all requests at once and waits for all of them.
    ///
    /// Each request succeeds or fails on its own. The results are in input order.
    pub async fn batch_request(&self, configs: Vec<RequestConfig>) -> BatchResponse {
        let start = Instant::now();
        let batch_id = BatchId::new();
        if configs.is_empty() {
            return BatchResponse {
                results: Vec::new(),
                batch_id,
                total_latency: Duration::ZERO,
            };
        }

        // everything is submitted before waiting, so that requests share batch windows
        let handles: Vec<_> = configs
            .into_iter()
            .map(|config| self.submit(config))
            .collect();
        let results = join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Ok(handle) => handle.await,
                Err(error) => Err(error),
            }
        }))
        .await;

        BatchResponse {
            results: results.into_iter().map(BatchEntryResult::from).collect(),
            batch_id,
            total_latency: start.elapsed(),
        }
    }

    /// Closes the current batch window right away.
    ///
    /// Returns the id of the dispatched batch, or `None` if no requests were waiting.
    pub fn flush_batch(&self) -> Option<BatchId> {
        let mut state = self.inner.state();
        self.inner.flush_locked(&mut state)
    }

    /// Cancels a pending or executing request.
    ///
    /// Returns `false` if the request is unknown or already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.inner.cancel(id)
    }

    /// Cancels every request that has not finished yet, returning their number.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_all()
    }

    /// Cancels everything and rejects all further requests.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.cancel_all();
        self.inner.state().dedup.reject_all(CoalescerError::Cancelled);
        tracing::debug!("Coalescer shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn clear_cache(&self) {
        self.inner.state().cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.inner.state().cache.len()
    }

    /// Submits all requests of the offline queue in FIFO order, regardless of connectivity.
    ///
    /// Returns the number of flushed requests.
    pub fn flush_offline_queue(&self) -> usize {
        self.inner.flush_offline()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Updates the connectivity. Coming back online flushes the offline queue.
    pub fn set_online(&self, online: bool) {
        let changed = {
            let _state = self.inner.state();
            self.inner.connectivity.set_online(online)
        };
        if !changed {
            return;
        }
        tracing::info!(online, "Connectivity changed");
        if online {
            self.flush_offline_queue();
        }
    }

    /// Follows an external connectivity signal until it closes or the coalescer is shut down.
    pub fn watch_connectivity(&self, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let online = *signal.borrow_and_update();
                match inner.upgrade() {
                    Some(inner) => Coalescer { inner }.set_online(online),
                    None => return,
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = signal.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// The number of requests that have not finished yet, including the offline queue.
    pub fn pending_count(&self) -> usize {
        self.inner.state().pending()
    }

    /// Returns the current state of a request.
    ///
    /// Finished requests can be looked up until they drop out of the bounded history.
    pub fn request_status(&self, id: RequestId) -> Option<TrackedRequest> {
        self.inner.state().lookup(id)
    }

    pub fn metrics(&self) -> CoalescerMetrics {
        let state = self.inner.state();
        state.metrics.snapshot(state.pending())
    }

    pub fn reset_metrics(&self) {
        self.inner.state().metrics.reset();
    }
}
