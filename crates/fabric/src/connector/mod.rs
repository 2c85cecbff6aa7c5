// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connector Runtime (C3): a uniform lifecycle, capability dispatch,
//! reconnection, and backpressure model for long-lived external sessions.
//!
//! A single generic [`ConnectorRuntime<T>`] carries the FSM, backoff,
//! rate limiter, dedup ring, device cache, and inbound pipeline shared by
//! every connector kind. Variant connectors differ only in their
//! [`Transport`] implementation and capability manifest — never by
//! subclassing a base connector with overridable hooks.

pub mod duplex;
pub mod polling;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::{Backoff, Clock};
use crate::error::{ConnectError, ExecuteError};
use crate::event::{Event, EventType};
use crate::registry::CapabilityRegistry;

/// Object-safe view of a connector, addressed by id from the Rule Engine
/// (C6) and Action Dispatcher (C7) without either knowing the concrete
/// [`Transport`] — the polymorphism-over-fixed-capability-set redesign
/// from spec §9 ("Ad-hoc inheritance of a base connector with overridable
/// hooks"). `ConnectorRuntime<T>` implements this for every `T: Transport`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;
    async fn connect(&self) -> Result<(), ConnectError>;
    async fn disconnect(&self);
    async fn execute(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: Map<String, Value>,
        deadline: Instant,
    ) -> Result<Value, ExecuteError>;
    async fn state(&self) -> ConnectorState;
    fn capabilities(&self) -> &CapabilityRegistry;
}

/// Per-connector-instance state (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    Disconnecting,
    Failed(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Net,
    Timeout,
    Exhausted,
}

/// Tunables named throughout spec §4.3 and §6.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub t_connect: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_reconnect_attempts: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_budget: u32,
    pub rate_limit_cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub dedup_window: usize,
    pub poll_interval: Duration,
    pub device_cache_ttl: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            t_connect: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_budget: 100,
            rate_limit_cooldown: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            dedup_window: 1024,
            poll_interval: Duration::from_secs(10),
            device_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// What a [`Transport`] must provide; everything else (FSM, backoff, rate
/// limiting, dedup, field discovery) lives once in [`ConnectorRuntime`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform authentication/discovery/subscription setup.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Tear down the session. Always succeeds; best-effort.
    async fn disconnect(&self);

    /// Dispatch one capability call over this transport's wire format.
    async fn execute_raw(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, ExecuteError>;

    /// Wait for and return the next inbound message as a JSON envelope
    /// (already demuxed from wire framing). `None` signals the transport
    /// session ended and the connector should move to `degraded`.
    async fn recv(&self) -> Option<Value>;

    /// Send a liveness probe. Returns `false` if the probe could not be
    /// sent at all (treated the same as a missed ack).
    async fn send_heartbeat(&self) -> bool;
}

/// Token-bucket rate limiter, window `W` / budget `B` (spec §4.3).
struct RateLimiter {
    budget: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(window: Duration, budget: u32) -> Self {
        let budget = budget as f64;
        Self {
            budget,
            refill_per_sec: budget / window.as_secs_f64().max(0.001),
            state: Mutex::new((budget, Instant::now())),
        }
    }

    fn refill(&self) {
        let mut st = self.state.lock();
        let elapsed = st.1.elapsed();
        st.0 = (st.0 + elapsed.as_secs_f64() * self.refill_per_sec).min(self.budget);
        st.1 = Instant::now();
    }

    fn try_acquire(&self) -> bool {
        self.refill();
        let mut st = self.state.lock();
        if st.0 >= 1.0 {
            st.0 -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block cooperatively until a token is free or `deadline` passes.
    async fn acquire(&self, deadline: Instant) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Fixed-capacity per-device ring of seen event ids (spec §9 resolution:
/// not a watermark scheme, since vendor ids are not guaranteed monotonic).
struct DedupRing {
    capacity: usize,
    per_device: Mutex<HashMap<String, DeviceWindow>>,
}

struct DeviceWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        Self { capacity, per_device: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if `event_id` was already seen for `device_id` (i.e.
    /// this is a duplicate and must be dropped), recording it otherwise.
    fn check_and_record(&self, device_id: &str, event_id: &str) -> bool {
        let mut devices = self.per_device.lock();
        let window = devices.entry(device_id.to_owned()).or_insert_with(|| DeviceWindow {
            order: VecDeque::with_capacity(self.capacity.min(256)),
            seen: HashSet::new(),
        });
        if window.seen.contains(event_id) {
            return true;
        }
        if window.order.len() >= self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        window.order.push_back(event_id.to_owned());
        window.seen.insert(event_id.to_owned());
        false
    }
}

/// Map device_id -> last known snapshot, TTL 5 min (spec §3).
struct DeviceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Value, Instant)>>,
}

impl DeviceCache {
    fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn put(&self, device_id: String, snapshot: Value) {
        self.entries.lock().insert(device_id, (snapshot, Instant::now()));
    }

    #[allow(dead_code)]
    fn get(&self, device_id: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(device_id) {
            Some((value, at)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(device_id);
                None
            }
            None => None,
        }
    }
}

/// Bounded per-type set of payload keys already seen, for field-discovery
/// meta-events (spec §4.3 step 4). Bounded so a chatty vendor field cannot
/// grow this without limit; once full, further new keys are silently
/// absorbed rather than emitting discovery events forever.
const FIELD_DISCOVERY_CAP: usize = 128;

struct FieldDiscovery {
    known_types: Mutex<HashSet<String>>,
    known_fields: Mutex<HashMap<String, HashSet<String>>>,
}

impl FieldDiscovery {
    fn new() -> Self {
        Self { known_types: Mutex::new(HashSet::new()), known_fields: Mutex::new(HashMap::new()) }
    }

    fn note_type(&self, raw_type: &str) -> bool {
        self.known_types.lock().insert(raw_type.to_owned())
    }

    fn note_fields(&self, raw_type: &str, payload: &Map<String, Value>) -> Vec<String> {
        let mut known = self.known_fields.lock();
        let set = known.entry(raw_type.to_owned()).or_default();
        if set.len() >= FIELD_DISCOVERY_CAP {
            return Vec::new();
        }
        let mut newly_seen = Vec::new();
        for key in payload.keys() {
            if set.len() >= FIELD_DISCOVERY_CAP {
                break;
            }
            if set.insert(key.clone()) {
                newly_seen.push(key.clone());
            }
        }
        newly_seen
    }
}

/// Atomic, externally-queryable counters (spec §5 "Supplemented features").
#[derive(Default)]
pub struct ConnectorCounters {
    pub dedup_drops: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub heartbeat_misses: AtomicU64,
}

/// Structural classification of an inbound envelope (spec §4.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classified {
    Heartbeat,
    ActionEnvelope,
    VendorEnvelope,
    ResourceUpdate,
    Unknown,
}

fn classify(envelope: &Map<String, Value>) -> Classified {
    let action = envelope.get("action").and_then(Value::as_str).unwrap_or("message");
    match action {
        "ping" | "pong" => Classified::Heartbeat,
        "add" | "remove" | "update" => Classified::ActionEnvelope,
        _ if envelope.contains_key("item") && envelope.contains_key("type") => Classified::VendorEnvelope,
        _ if envelope.contains_key("modelKey") && envelope.contains_key("id") => Classified::ResourceUpdate,
        _ => Classified::Unknown,
    }
}

fn resolve_event_type(raw_type: &str) -> (EventType, bool) {
    match serde_json::from_value::<EventType>(Value::String(raw_type.to_owned())) {
        Ok(t) => (t, false),
        Err(_) => (EventType::Generic, true),
    }
}

/// Generic connector: one FSM, one backoff policy, one dedup ring, one
/// inbound pipeline, parameterized only by its [`Transport`].
pub struct ConnectorRuntime<T: Transport> {
    pub id: String,
    transport: Arc<T>,
    registry: Arc<CapabilityRegistry>,
    bus: EventBus,
    clock: Clock,
    config: ConnectorConfig,
    state: RwLock<ConnectorState>,
    rate_limiter: RateLimiter,
    dedup: DedupRing,
    device_cache: DeviceCache,
    discovery: FieldDiscovery,
    pub counters: Arc<ConnectorCounters>,
    cancel: CancellationToken,
    last_heartbeat_ack_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    heartbeat_misses: AtomicU32,
    backoff: Mutex<Backoff>,
    /// Self-reference populated at construction (`Arc::new_cyclic`) so the
    /// object-safe [`Connector`] impl, which only has `&self`, can recover
    /// an `Arc<Self>` for the handful of internal methods that spawn child
    /// tasks and therefore need to extend their own lifetime.
    self_weak: Weak<Self>,
}

impl<T: Transport> ConnectorRuntime<T> {
    pub fn new(
        id: impl Into<String>,
        transport: T,
        registry: Arc<CapabilityRegistry>,
        bus: EventBus,
        clock: Clock,
        config: ConnectorConfig,
    ) -> Arc<Self> {
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap, config.max_reconnect_attempts);
        Arc::new_cyclic(|self_weak| Self {
            id: id.into(),
            transport: Arc::new(transport),
            registry,
            bus,
            clock,
            rate_limiter: RateLimiter::new(config.rate_limit_window, config.rate_limit_budget),
            dedup: DedupRing::new(config.dedup_window),
            device_cache: DeviceCache::new(config.device_cache_ttl),
            discovery: FieldDiscovery::new(),
            counters: Arc::new(ConnectorCounters::default()),
            cancel: CancellationToken::new(),
            last_heartbeat_ack_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            heartbeat_misses: AtomicU32::new(0),
            backoff: Mutex::new(backoff),
            self_weak: self_weak.clone(),
            config,
        })
    }

    pub async fn state(&self) -> ConnectorState {
        *self.state.read().await
    }

    async fn set_state(&self, next: ConnectorState) {
        *self.state.write().await = next;
    }

    /// `connect()` per spec §4.3: idempotent from `idle`/`failed`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let current = self.state().await;
        if !matches!(current, ConnectorState::Idle | ConnectorState::Failed(_)) {
            return Ok(());
        }
        self.set_state(ConnectorState::Connecting).await;

        let attempt = self.transport.connect();
        let result = tokio::time::timeout(self.config.t_connect, attempt).await;

        match result {
            Ok(Ok(())) => {
                self.backoff.lock().reset();
                self.heartbeat_misses.store(0, Ordering::Relaxed);
                self.set_state(ConnectorState::Connected).await;
                self.spawn_reader_task();
                self.spawn_heartbeat_task();
                Ok(())
            }
            Ok(Err(ConnectError::Auth(msg))) => {
                self.set_state(ConnectorState::Failed(FailureKind::Auth)).await;
                Err(ConnectError::Auth(msg))
            }
            Ok(Err(ConnectError::Unreachable(msg))) => {
                self.set_state(ConnectorState::Failed(FailureKind::Net)).await;
                Err(ConnectError::Unreachable(msg))
            }
            Ok(Err(other)) => {
                self.set_state(ConnectorState::Failed(FailureKind::Net)).await;
                Err(other)
            }
            Err(_) => {
                self.set_state(ConnectorState::Failed(FailureKind::Timeout)).await;
                Err(ConnectError::Timeout(self.config.t_connect))
            }
        }
    }

    /// `disconnect()`: idempotent, terminal within 10 s regardless of
    /// outstanding I/O (spec §4.3, §5).
    pub async fn disconnect(self: &Arc<Self>) {
        self.set_state(ConnectorState::Disconnecting).await;
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.transport.disconnect()).await;
        self.set_state(ConnectorState::Idle).await;
    }

    /// `execute()` per spec §4.3: requires `connected`; never retries here
    /// (retry policy belongs to C7).
    pub async fn execute(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: Map<String, Value>,
        deadline: Instant,
    ) -> Result<Value, ExecuteError> {
        if self.state().await != ConnectorState::Connected {
            return Err(ExecuteError::NotConnected);
        }

        match self.registry.validate(capability_id, operation, &parameters) {
            Ok(()) => {}
            Err(crate::registry::ValidationOutcome::UnknownCapability) => {
                return Err(ExecuteError::UnknownCapability(capability_id.to_owned()));
            }
            Err(crate::registry::ValidationOutcome::UnknownOperation) => {
                return Err(ExecuteError::UnknownOperation {
                    capability: capability_id.to_owned(),
                    operation: operation.to_owned(),
                });
            }
            Err(crate::registry::ValidationOutcome::Param(e)) => return Err(ExecuteError::Param(e)),
        }

        if !self.rate_limiter.acquire(deadline).await {
            return Err(ExecuteError::Timeout(deadline.saturating_duration_since(Instant::now())));
        }

        match self.transport.execute_raw(capability_id, operation, &parameters).await {
            Err(ExecuteError::RateLimited(cooldown)) => {
                tokio::time::sleep(cooldown.min(self.config.rate_limit_cooldown)).await;
                self.transport.execute_raw(capability_id, operation, &parameters).await
            }
            other => other,
        }
    }

    fn spawn_reader_task(self: &Arc<Self>) {
        let rt = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rt.transport.recv() => msg,
                };
                match next {
                    Some(envelope) => rt.ingest(envelope).await,
                    None => {
                        rt.on_transport_lost().await;
                        break;
                    }
                }
            }
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let rt = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rt.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if rt.state().await != ConnectorState::Connected {
                    continue;
                }
                let sent_at = epoch_ms(&rt.clock);
                let sent = rt.transport.send_heartbeat().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(rt.config.heartbeat_timeout) => {}
                }
                // Either an explicit ping/pong ack or any inbound activity
                // since the probe was sent counts as liveness — a polling
                // transport has no ping/pong concept and relies entirely on
                // the latter (spec §4.3: polling is itself a fallback
                // liveness source).
                let acked = sent
                    && (rt.last_heartbeat_ack_ms.load(Ordering::Relaxed) >= sent_at
                        || rt.last_activity_ms.load(Ordering::Relaxed) >= sent_at);
                if acked {
                    rt.heartbeat_misses.store(0, Ordering::Relaxed);
                    continue;
                }
                rt.counters.heartbeat_misses.fetch_add(1, Ordering::Relaxed);
                if rt.heartbeat_misses.fetch_add(1, Ordering::Relaxed) + 1 >= 2 {
                    rt.on_transport_lost().await;
                    break;
                }
            }
        });
    }

    async fn on_transport_lost(self: &Arc<Self>) {
        let current = self.state().await;
        if matches!(current, ConnectorState::Disconnecting | ConnectorState::Idle) {
            return;
        }
        self.set_state(ConnectorState::Degraded).await;
        self.reconnect_loop().await;
    }

    /// Reconnection policy: exponential backoff with jitter, `n` capped at
    /// `max_reconnect_attempts` before `failed(exhausted)` (spec §4.3).
    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let exhausted = self.backoff.lock().exhausted();
            if exhausted {
                self.set_state(ConnectorState::Failed(FailureKind::Exhausted)).await;
                return;
            }
            let delay = self.backoff.lock().next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.set_state(ConnectorState::Connecting).await;
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(self.config.t_connect, self.transport.connect()).await {
                Ok(Ok(())) => {
                    self.backoff.lock().reset();
                    self.heartbeat_misses.store(0, Ordering::Relaxed);
                    self.set_state(ConnectorState::Connected).await;
                    self.spawn_reader_task();
                    self.spawn_heartbeat_task();
                    return;
                }
                Ok(Err(ConnectError::Auth(_))) => {
                    self.set_state(ConnectorState::Failed(FailureKind::Auth)).await;
                    return;
                }
                _ => {
                    self.set_state(ConnectorState::Degraded).await;
                }
            }
        }
    }

    /// The single inbound pipeline: `frame -> classified_message -> event ->
    /// publish` (spec §9 design note; §4.3 steps 2-6).
    async fn ingest(self: &Arc<Self>, envelope: Value) {
        self.last_activity_ms.store(epoch_ms(&self.clock), Ordering::Relaxed);
        let Some(obj) = envelope.as_object() else {
            self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(connector_id = %self.id, "inbound message was not a JSON object, skipped");
            return;
        };
        let obj = obj.clone();

        match classify(&obj) {
            Classified::Heartbeat => {
                self.note_heartbeat_ack();
                return;
            }
            Classified::Unknown => {
                tracing::debug!(connector_id = %self.id, "unclassifiable inbound message, skipped");
            }
            _ => {}
        }

        let raw_type = obj
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| obj.get("item").and_then(Value::as_str))
            .unwrap_or("generic")
            .to_owned();

        let (event_type, is_new_type) = resolve_event_type(&raw_type);
        if is_new_type && self.discovery.note_type(&raw_type) {
            self.emit_meta(EventType::EventTypeDiscovered, serde_json::json!({ "type": raw_type }));
        }
        for field in self.discovery.note_fields(&raw_type, &obj) {
            self.emit_meta(EventType::FieldsDiscovered, serde_json::json!({ "type": raw_type, "field": field }));
        }

        let device_id = Event::extract_device_id(event_type, &obj);
        let event_id = obj
            .get("eventId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(device_id) = &device_id {
            if self.dedup.check_and_record(device_id, &event_id) {
                self.counters.dedup_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.device_cache.put(device_id.clone(), Value::Object(obj.clone()));
        }

        let capabilities_observed = Event::derive_capabilities(&obj);
        let now = self.clock.now();
        let occurred_at = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
            .unwrap_or(now.wall);

        let event = Event {
            id: event_id,
            source_connector_id: self.id.clone(),
            event_type,
            device_id,
            occurred_at,
            received_at: now.wall,
            payload: obj,
            capabilities_observed,
        };
        self.bus.publish(event);
    }

    fn note_heartbeat_ack(&self) {
        self.last_heartbeat_ack_ms.store(epoch_ms(&self.clock), Ordering::Relaxed);
    }

    fn emit_meta(&self, event_type: EventType, fields: Value) {
        let now = self.clock.now();
        let mut payload = Map::new();
        if let Value::Object(map) = fields {
            payload = map;
        }
        self.bus.publish(Event {
            id: uuid::Uuid::new_v4().to_string(),
            source_connector_id: self.id.clone(),
            event_type,
            device_id: None,
            occurred_at: now.wall,
            received_at: now.wall,
            payload,
            capabilities_observed: Default::default(),
        });
    }
}

fn epoch_ms(clock: &Clock) -> u64 {
    clock.now().wall.timestamp_millis().max(0) as u64
}

#[async_trait]
impl<T: Transport> Connector for ConnectorRuntime<T> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let Some(this) = self.self_weak.upgrade() else {
            return Err(ConnectError::Config("connector dropped".to_owned()));
        };
        ConnectorRuntime::connect(&this).await
    }

    async fn disconnect(&self) {
        let Some(this) = self.self_weak.upgrade() else { return };
        ConnectorRuntime::disconnect(&this).await
    }

    async fn execute(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: Map<String, Value>,
        deadline: Instant,
    ) -> Result<Value, ExecuteError> {
        ConnectorRuntime::execute(self, capability_id, operation, parameters, deadline).await
    }

    async fn state(&self) -> ConnectorState {
        ConnectorRuntime::state(self).await
    }

    fn capabilities(&self) -> &CapabilityRegistry {
        &self.registry
    }
}
