//! The bounded event bus and its worker pool.
//!
//! Publishing never blocks the tick loop unless the bus is configured with
//! [`BackpressurePolicy::Block`]. Events of the same type are delivered
//! one at a time in publish order: a worker only picks up an event whose
//! type is not already being handled by another worker. Events of
//! different types are processed concurrently and have no cross-type
//! ordering guarantee.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt as _;
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackpressurePolicy, EventBusConfig};
use crate::event::{Event, Topic};
use crate::handler::{EventHandler, FnHandler, HandlerError};

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event was queued without displacing anything.
    Queued,
    /// The event was queued after evicting the oldest queued event.
    DisplacedOldest,
    /// The event was not queued.
    Dropped,
}

impl PublishOutcome {
    /// Whether the published event made it onto the queue.
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Point-in-time view of the bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BusStats {
    /// Events passed to `publish` or `try_publish`.
    pub published: u64,
    /// Events whose handlers have all been invoked.
    pub delivered: u64,
    /// Events lost to backpressure or shutdown.
    pub dropped: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_errors: u64,
    /// Events currently waiting in the queue.
    pub queue_depth: usize,
    /// Configured queue capacity.
    pub capacity: usize,
}

/// Bounded, asynchronous publish/subscribe bus.
///
/// Cloning an `EventBus` yields another handle to the same queue.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

struct Shared {
    config: EventBusConfig,
    queue: Mutex<QueueState>,
    work_ready: Notify,
    space_ready: Notify,
    idle: Notify,
    subscriptions: RwLock<SubscriptionTable>,
    counters: Counters,
    next_sequence: AtomicU64,
    next_subscription: AtomicU64,
    closing: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    history: Mutex<VecDeque<Arc<Event>>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<Event>>,
    busy_types: BTreeSet<String>,
    in_flight: usize,
}

#[derive(Default)]
struct SubscriptionTable {
    by_type: BTreeMap<String, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

enum Admission {
    Queued,
    Evicted(Arc<Event>),
    Rejected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    /// Create a bus. Workers are not running until [`start`](Self::start).
    pub fn new(mut config: EventBusConfig) -> Self {
        config.capacity = config.capacity.max(1);
        config.workers = config.workers.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(QueueState::default()),
                work_ready: Notify::new(),
                space_ready: Notify::new(),
                idle: Notify::new(),
                subscriptions: RwLock::new(SubscriptionTable::default()),
                counters: Counters::default(),
                next_sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The configuration the bus was built with.
    pub fn config(&self) -> &EventBusConfig {
        &self.shared.config
    }

    /// Spawn the worker pool. Calling `start` on a running bus is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut workers = lock(&self.shared.workers);
        if !workers.is_empty() {
            return;
        }
        self.shared.closing.store(false, Ordering::Release);
        for worker in 0..self.shared.config.workers {
            workers.push(tokio::spawn(worker_loop(Arc::clone(&self.shared), worker)));
        }
        info!(
            workers = self.shared.config.workers,
            capacity = self.shared.config.capacity,
            policy = ?self.shared.config.backpressure,
            "Event bus started"
        );
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        !lock(&self.shared.workers).is_empty()
    }

    /// Stop accepting events, let the workers drain the queue, and wait for
    /// them to exit.
    pub async fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.work_ready.notify_waiters();
        self.shared.space_ready.notify_waiters();

        let handles = std::mem::take(&mut *lock(&self.shared.workers));
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Event bus worker terminated abnormally");
            }
        }
        let stats = self.stats();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            dropped = stats.dropped,
            handler_errors = stats.handler_errors,
            "Event bus stopped"
        );
    }

    /// Publish an event, applying the configured backpressure policy.
    ///
    /// Only [`BackpressurePolicy::Block`] can make this call wait, and never
    /// for longer than `block_timeout_ms`.
    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> PublishOutcome {
        let event = self.shared.stamp(event_type.into(), payload);
        match self.shared.config.backpressure {
            BackpressurePolicy::Block => self.shared.push_blocking(event).await,
            BackpressurePolicy::DropNewest | BackpressurePolicy::DropOldest => {
                self.shared.push(event)
            }
        }
    }

    /// Publish without waiting. Under [`BackpressurePolicy::Block`] a full
    /// queue rejects the event.
    pub fn try_publish(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> PublishOutcome {
        let event = self.shared.stamp(event_type.into(), payload);
        self.shared.push(event)
    }

    /// Register a handler for a topic. The same handler may be registered
    /// several times; each registration is invoked once per matching event.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId(
            self.shared
                .next_subscription
                .fetch_add(1, Ordering::Relaxed),
        );
        let subscription = Subscription { id, handler };
        let mut table = self
            .shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match &topic {
            Topic::All => table.wildcard.push(subscription),
            Topic::Type(event_type) => table
                .by_type
                .entry(event_type.clone())
                .or_default()
                .push(subscription),
        }
        debug!(topic = %topic, subscription = id.0, "Handler subscribed");
        id
    }

    /// Register a synchronous closure as a handler.
    pub fn subscribe_fn<F>(&self, topic: impl Into<Topic>, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler::new(f)))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self
            .shared
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = table.wildcard.len();
        table.wildcard.retain(|s| s.id != id);
        let mut removed = table.wildcard.len() != before;
        for handlers in table.by_type.values_mut() {
            let before = handlers.len();
            handlers.retain(|s| s.id != id);
            removed |= handlers.len() != before;
        }
        table.by_type.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Receive matching events on a broadcast channel.
    ///
    /// Slow receivers observe [`broadcast::error::RecvError::Lagged`] rather
    /// than slowing down the bus.
    pub fn stream(
        &self,
        topic: impl Into<Topic>,
        capacity: usize,
    ) -> broadcast::Receiver<Arc<Event>> {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        self.subscribe(topic, Arc::new(StreamForwarder { sender }));
        receiver
    }

    /// Resolve once the queue is empty and no handler is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            idle.await;
        }
    }

    /// Current counters and queue depth.
    pub fn stats(&self) -> BusStats {
        let counters = &self.shared.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            handler_errors: counters.handler_errors.load(Ordering::Relaxed),
            queue_depth: lock(&self.shared.queue).pending.len(),
            capacity: self.shared.config.capacity,
        }
    }

    /// The most recently delivered events, oldest first, optionally
    /// filtered by type.
    pub fn recent(&self, event_type: Option<&str>, limit: usize) -> Vec<Arc<Event>> {
        let history = lock(&self.shared.history);
        let mut matching: Vec<Arc<Event>> = history
            .iter()
            .rev()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn stamp(&self, event_type: String, payload: serde_json::Value) -> Arc<Event> {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Arc::new(Event {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            event_type,
            payload,
            published_at: Utc::now(),
        })
    }

    fn push(&self, event: Arc<Event>) -> PublishOutcome {
        if self.closing.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event_type = %event.event_type, "Event bus closing, event dropped");
            return PublishOutcome::Dropped;
        }

        let admission = {
            let mut queue = lock(&self.queue);
            if queue.pending.len() < self.config.capacity {
                queue.pending.push_back(Arc::clone(&event));
                Admission::Queued
            } else {
                match self.config.backpressure {
                    BackpressurePolicy::DropOldest => {
                        let evicted = queue.pending.pop_front();
                        queue.pending.push_back(Arc::clone(&event));
                        evicted.map_or(Admission::Queued, Admission::Evicted)
                    }
                    BackpressurePolicy::DropNewest | BackpressurePolicy::Block => {
                        Admission::Rejected
                    }
                }
            }
        };

        match admission {
            Admission::Queued => {
                self.work_ready.notify_waiters();
                PublishOutcome::Queued
            }
            Admission::Evicted(evicted) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %evicted.event_type,
                    sequence = evicted.sequence,
                    capacity = self.config.capacity,
                    "Event queue full, dropped oldest event"
                );
                self.work_ready.notify_waiters();
                PublishOutcome::DisplacedOldest
            }
            Admission::Rejected => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = %event.event_type,
                    sequence = event.sequence,
                    "Event queue full, dropped new event"
                );
                PublishOutcome::Dropped
            }
        }
    }

    async fn push_blocking(&self, event: Arc<Event>) -> PublishOutcome {
        let deadline = tokio::time::Instant::now()
            .checked_add(Duration::from_millis(self.config.block_timeout_ms))
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.closing.load(Ordering::Acquire) {
                return self.push(event);
            }
            {
                let mut queue = lock(&self.queue);
                if queue.pending.len() < self.config.capacity {
                    queue.pending.push_back(event);
                    drop(queue);
                    self.work_ready.notify_waiters();
                    return PublishOutcome::Queued;
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    sequence = event.sequence,
                    timeout_ms = self.config.block_timeout_ms,
                    "Timed out waiting for event queue space, event dropped"
                );
                return PublishOutcome::Dropped;
            }
        }
    }

    /// Take the oldest pending event whose type is not already in flight.
    fn take_next(&self) -> Option<Arc<Event>> {
        let mut guard = lock(&self.queue);
        let QueueState {
            pending,
            busy_types,
            in_flight,
        } = &mut *guard;
        let position = pending
            .iter()
            .position(|e| !busy_types.contains(&e.event_type))?;
        let event = pending.remove(position)?;
        busy_types.insert(event.event_type.clone());
        *in_flight = in_flight.saturating_add(1);
        Some(event)
    }

    fn finish(&self, event: &Event) {
        let idle = {
            let mut queue = lock(&self.queue);
            queue.busy_types.remove(&event.event_type);
            queue.in_flight = queue.in_flight.saturating_sub(1);
            queue.pending.is_empty() && queue.in_flight == 0
        };
        self.work_ready.notify_waiters();
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        let queue = lock(&self.queue);
        queue.pending.is_empty() && queue.in_flight == 0
    }

    fn is_drained(&self) -> bool {
        lock(&self.queue).pending.is_empty()
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let table = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        table
            .by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(table.wildcard.iter())
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    async fn dispatch(&self, event: &Arc<Event>) {
        for handler in self.handlers_for(&event.event_type) {
            let outcome = AssertUnwindSafe(handler.handle(Arc::clone(event)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        event_type = %event.event_type,
                        sequence = event.sequence,
                        error = %err,
                        "Event handler failed"
                    );
                }
                Err(panic) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        event_type = %event.event_type,
                        sequence = event.sequence,
                        panic = panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.remember(event);
    }

    fn remember(&self, event: &Arc<Event>) {
        let limit = self.config.history_capacity;
        if limit == 0 {
            return;
        }
        let mut history = lock(&self.history);
        history.push_back(Arc::clone(event));
        while history.len() > limit {
            history.pop_front();
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "Event bus worker started");
    loop {
        let ready = shared.work_ready.notified();
        tokio::pin!(ready);
        ready.as_mut().enable();

        if let Some(event) = shared.take_next() {
            shared.space_ready.notify_waiters();
            shared.dispatch(&event).await;
            shared.finish(&event);
            continue;
        }
        if shared.closing.load(Ordering::Acquire) && shared.is_drained() {
            break;
        }
        ready.await;
    }
    debug!(worker, "Event bus worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct StreamForwarder {
    sender: broadcast::Sender<Arc<Event>>,
}

#[async_trait]
impl EventHandler for StreamForwarder {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        // No receivers left is not a handler failure.
        let _ = self.sender.send(event);
        Ok(())
    }
}
