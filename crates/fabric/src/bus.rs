// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Bus (C5): bounded multi-subscriber pub/sub with per-source FIFO
//! ordering, per-subscriber drop policies, and no global ordering across
//! sources (spec §4.5).
//!
//! Two-stage buffering, matching the spec text directly:
//! `publish()` enqueues onto a per-source ring (size `Q_src`, drop-oldest on
//! overflow). A single dispatcher task per source then pops that ring in
//! FIFO order and forwards to every matching subscription's own bounded
//! queue (size `Q_sub`), applying that subscription's drop policy on
//! overflow. Running one dispatcher per source — never per subscriber —
//! is what gives invariant #2 (same-source events arrive at each
//! subscriber in publish order) for free: the dispatcher visits
//! subscriptions in a fixed order for each popped event.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

const DEFAULT_Q_SRC: usize = 1024;
const DEFAULT_Q_SUB: usize = 256;
const DEFAULT_T_BP: Duration = Duration::from_millis(100);

/// A pure predicate over `(type, source_connector_id, device_id, payload)`.
/// Unknown fields referenced by a filter cause no match, never a fault —
/// enforced simply by filters being plain closures over `&Event`.
#[derive(Clone)]
pub struct Filter {
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl Filter {
    pub fn new(predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self { predicate: Arc::new(predicate) }
    }

    pub fn any() -> Self {
        Self::new(|_| true)
    }

    pub fn by_source(source_connector_id: impl Into<String>) -> Self {
        let id = source_connector_id.into();
        Self::new(move |e| e.source_connector_id == id)
    }

    pub fn by_capability(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(move |e| e.capabilities_observed.contains(&tag))
    }

    pub fn matches(&self, event: &Event) -> bool {
        (self.predicate)(event)
    }

    /// Combine two filters with logical AND.
    pub fn and(self, other: Filter) -> Filter {
        Filter::new(move |e| self.matches(e) && other.matches(e))
    }
}

/// What a subscription does when its delivery queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
    SlowDownSource,
}

/// A bound async callback invoked by the bus worker for each delivered
/// event. Must not block indefinitely — it runs on the per-subscription
/// delivery task.
pub type Sink = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Simple bounded FIFO guarded by a short critical section (no suspension
/// points held across the lock), woken via `Notify`.
struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    overflow: AtomicU64,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::with_capacity(capacity.min(64))), capacity, notify: Notify::new(), overflow: AtomicU64::new(0) }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Push, dropping the oldest item if full. Returns true if something
    /// was dropped.
    fn push_drop_oldest(&self, item: T) -> bool {
        let mut dropped = false;
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                dropped = true;
            }
            items.push_back(item);
        }
        if dropped {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Push only if there is room; returns false (and drops the item) if full.
    fn try_push_drop_newest(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    async fn pop_wait(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

struct SourceRing {
    queue: BoundedQueue<Event>,
}

struct Subscription {
    id: u64,
    filter: Filter,
    queue: BoundedQueue<Event>,
    drop_policy: DropPolicy,
    cancel: CancellationToken,
    delivered: AtomicU64,
}

struct Inner {
    sources: Mutex<HashMap<String, Arc<SourceRing>>>,
    /// Ordered so a single source's dispatcher visits subscriptions in a
    /// fixed, reproducible order every time (needed for per-subscriber
    /// FIFO, not for any cross-subscriber guarantee).
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    next_sub_id: AtomicU64,
    q_src: usize,
    q_sub_default: usize,
    t_bp: Duration,
    shutdown: CancellationToken,
}

/// In-process publish/subscribe fabric (spec §4.5).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// A live subscription. Dropping this handle does not unsubscribe —
/// callers that want cleanup on drop should call [`SubscriptionHandle::unsubscribe`]
/// explicitly (matching the explicit-cancellation style used throughout
/// this fabric rather than RAII-implicit teardown).
pub struct SubscriptionHandle {
    id: u64,
    bus: EventBus,
}

impl SubscriptionHandle {
    /// Unsubscribe. Idempotent; in-flight deliveries may still complete but
    /// no new ones are scheduled after this returns.
    pub fn unsubscribe(&self) {
        self.bus.unsubscribe(self.id);
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_Q_SRC, DEFAULT_Q_SUB, DEFAULT_T_BP)
    }

    pub fn with_capacity(q_src: usize, q_sub_default: usize, t_bp: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sources: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(1),
                q_src,
                q_sub_default,
                t_bp,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Non-blocking publish. Enqueues on the source's ring; drops oldest on
    /// overflow. Spawns the source's dispatcher task lazily on first publish.
    pub fn publish(&self, event: Event) {
        let source_id = event.source_connector_id.clone();
        let ring = {
            let mut sources = self.inner.sources.lock();
            if let Some(ring) = sources.get(&source_id) {
                Arc::clone(ring)
            } else {
                let ring = Arc::new(SourceRing { queue: BoundedQueue::new(self.inner.q_src) });
                sources.insert(source_id.clone(), Arc::clone(&ring));
                self.spawn_dispatcher(source_id.clone(), Arc::clone(&ring));
                ring
            }
        };
        ring.queue.push_drop_oldest(event);
    }

    /// Overflow count for a single source's ring (events dropped before
    /// ever reaching the dispatcher).
    pub fn source_overflow(&self, source_connector_id: &str) -> u64 {
        self.inner
            .sources
            .lock()
            .get(source_connector_id)
            .map(|r| r.queue.overflow.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Subscribe with a filter, sink, drop policy, and optional queue size
    /// override (defaults to `Q_sub`).
    pub fn subscribe(
        &self,
        filter: Filter,
        sink: Sink,
        drop_policy: DropPolicy,
        queue_size: Option<usize>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            filter,
            queue: BoundedQueue::new(queue_size.unwrap_or(self.inner.q_sub_default)),
            drop_policy,
            cancel: CancellationToken::new(),
            delivered: AtomicU64::new(0),
        });
        self.inner.subscriptions.lock().push(Arc::clone(&sub));
        self.spawn_subscriber_worker(sub, sink);
        SubscriptionHandle { id, bus: self.clone() }
    }

    /// Overflow counter for a given subscription (events dropped by its
    /// drop policy, not counting source-ring drops).
    pub fn subscription_overflow(&self, id: u64) -> u64 {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.queue.overflow.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscription_delivered(&self, id: u64) -> u64 {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.delivered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn unsubscribe(&self, id: u64) {
        let sub = {
            let mut subs = self.inner.subscriptions.lock();
            let idx = subs.iter().position(|s| s.id == id);
            idx.map(|i| subs.remove(i))
        };
        if let Some(sub) = sub {
            sub.cancel.cancel();
        }
    }

    /// Cancel every source dispatcher and subscriber worker. No new events
    /// are published or delivered after this returns.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for sub in self.inner.subscriptions.lock().drain(..) {
            sub.cancel.cancel();
        }
    }

    fn spawn_dispatcher(&self, source_id: String, ring: Arc<SourceRing>) {
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let Some(event) = ring.queue.pop_wait(&shutdown).await else { break };

                // Snapshot the current subscription list in a fixed order
                // so every event from this source visits subscribers in
                // the same order, preserving per-subscriber FIFO.
                let subs: Vec<Arc<Subscription>> = inner.subscriptions.lock().clone();
                for sub in &subs {
                    if sub.cancel.is_cancelled() || !sub.filter.matches(&event) {
                        continue;
                    }
                    deliver(sub, event.clone(), inner.t_bp).await;
                }
                let _ = &source_id; // retained for future per-source metrics
            }
        });
    }

    fn spawn_subscriber_worker(&self, sub: Arc<Subscription>, sink: Sink) {
        let cancel = sub.cancel.clone();
        tokio::spawn(async move {
            loop {
                let Some(event) = sub.queue.pop_wait(&cancel).await else { break };
                sink(event).await;
                sub.delivered.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver one event to one subscription, applying its drop policy.
async fn deliver(sub: &Arc<Subscription>, event: Event, t_bp: Duration) {
    match sub.drop_policy {
        DropPolicy::DropOldest => {
            sub.queue.push_drop_oldest(event);
        }
        DropPolicy::DropNewest => {
            sub.queue.try_push_drop_newest(event);
        }
        DropPolicy::SlowDownSource => {
            let deadline = tokio::time::Instant::now() + t_bp;
            loop {
                if sub.queue.len() < sub.queue.capacity {
                    sub.queue.try_push_drop_newest(event);
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    sub.queue.push_drop_oldest(event);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod bus_tests;
