// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Action Dispatcher (C7): bounded concurrent, timed, fingerprint-
//! deduplicated execution of action invocations produced by the Rule
//! Engine (C6), per spec §4.7.
//!
//! A pool of `W` worker tasks (default 16) pull from one bounded queue
//! (default 256, reject-newest-with-counter on overflow). Each invocation
//! gets its own per-fingerprint cancellation token so an in-flight call can
//! be aborted at its earliest suspension point without tearing down the
//! worker that is running it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::Backoff;
use crate::connector_registry::ConnectorRegistry;
use crate::error::{DispatchError, ExecuteError};
use crate::event::{Event, EventType};
use crate::fingerprint::InFlightRegistry;
use crate::rules::ActionInvocation;

/// Tunables named in spec §4.7 / §6.
#[derive(Debug, Clone)]
pub struct ActionDispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub default_deadline: Duration,
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for ActionDispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: 256,
            default_deadline: Duration::from_secs(10),
            retry_max_attempts: 3,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(5),
        }
    }
}

/// The dispatcher's bounded input queue. Overflow policy is reject-newest
/// with a recorded counter (spec §4.7): the action is lost, and it is the
/// rule's responsibility to deduplicate sensibly.
pub struct ActionQueue {
    tx: mpsc::Sender<ActionInvocation>,
    overflow: AtomicU64,
}

impl ActionQueue {
    /// Build a queue of the given capacity, returning the handle rules
    /// enqueue onto and the receiving half workers (or a test) drain.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ActionInvocation>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx, overflow: AtomicU64::new(0) }), rx)
    }

    /// Enqueue one invocation. Returns `false` (and counts an overflow) if
    /// the queue is full; never blocks the caller.
    pub fn try_enqueue(&self, invocation: ActionInvocation) -> bool {
        match self.tx.try_send(invocation) {
            Ok(()) => true,
            Err(_) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// Executes action invocations under bounded concurrency with per-
/// invocation deadlines and a closed retry policy (spec §4.7).
pub struct ActionDispatcher {
    in_flight: Arc<InFlightRegistry>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ActionDispatcher {
    /// Spawn the worker pool and return the dispatcher handle plus the
    /// queue the Rule Engine enqueues invocations onto.
    pub fn spawn(
        config: ActionDispatcherConfig,
        connectors: Arc<ConnectorRegistry>,
        bus: EventBus,
        in_flight: Arc<InFlightRegistry>,
    ) -> (Arc<Self>, Arc<ActionQueue>) {
        let (queue, rx) = ActionQueue::new(config.queue_capacity);
        let dispatcher = Arc::new(Self {
            in_flight,
            cancel_tokens: Mutex::new(HashMap::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..config.workers.max(1) {
            let dispatcher = Arc::clone(&dispatcher);
            let connectors = Arc::clone(&connectors);
            let bus = bus.clone();
            let config = config.clone();
            let shared_rx = Arc::clone(&shared_rx);
            tokio::spawn(async move {
                loop {
                    let invocation = {
                        let mut rx = shared_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(invocation) = invocation else { break };
                    dispatcher.process(invocation, &connectors, &bus, &config).await;
                }
            });
        }

        (dispatcher, queue)
    }

    /// Cancel a pending or in-flight invocation by fingerprint. Returns
    /// `true` if a cancellation token was found and signalled; aborts the
    /// underlying capability call at its earliest suspension point (spec
    /// §4.7 "Cancellation").
    pub fn cancel(&self, fingerprint: &str) -> bool {
        if let Some(token) = self.cancel_tokens.lock().get(fingerprint) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    async fn process(
        &self,
        mut invocation: ActionInvocation,
        connectors: &Arc<ConnectorRegistry>,
        bus: &EventBus,
        config: &ActionDispatcherConfig,
    ) {
        let cancel = CancellationToken::new();
        self.cancel_tokens.lock().insert(invocation.fingerprint.clone(), cancel.clone());

        let outcome = self.run_with_retries(&mut invocation, connectors, config, &cancel).await;

        self.cancel_tokens.lock().remove(&invocation.fingerprint);
        self.in_flight.finish(&invocation.fingerprint);

        match outcome {
            Ok(result) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.emit(bus, &invocation, EventType::ActionCompleted, json!({ "result": result }));
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.emit(bus, &invocation, EventType::ActionFailed, json!({ "error": err.to_string() }));
            }
        }
    }

    /// Step 1-3 of spec §4.7: look up connector, execute with a deadline,
    /// retrying `UpstreamError`/`Timeout` per the closed retry policy.
    /// Every other error (bad params, unknown capability, not connected)
    /// surfaces immediately with no retry.
    async fn run_with_retries(
        &self,
        invocation: &mut ActionInvocation,
        connectors: &Arc<ConnectorRegistry>,
        config: &ActionDispatcherConfig,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let Some(connector) = connectors.get(&invocation.connector_id).await else {
                return Err(DispatchError::UnknownConnector(invocation.connector_id.clone()));
            };
            if connector.state().await != crate::connector::ConnectorState::Connected {
                return Err(DispatchError::Execute(ExecuteError::NotConnected));
            }

            let per_call_deadline = Instant::now() + config.default_deadline.min(invocation.deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)));
            let call = connector.execute(
                &invocation.capability_id,
                &invocation.operation,
                invocation.parameters.clone(),
                per_call_deadline,
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                r = call => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err @ (ExecuteError::Upstream(_) | ExecuteError::Timeout(_))) => {
                    invocation.attempt += 1;
                    if invocation.attempt >= config.retry_max_attempts {
                        return Err(DispatchError::Execute(err));
                    }
                    let delay = Backoff::delay_for(config.retry_base, config.retry_cap, invocation.attempt - 1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(other) => return Err(DispatchError::Execute(other)),
            }
        }
    }

    fn emit(&self, bus: &EventBus, invocation: &ActionInvocation, event_type: EventType, extra: serde_json::Value) {
        let mut payload = serde_json::Map::new();
        payload.insert("invocation_id".to_owned(), json!(invocation.id));
        payload.insert("fingerprint".to_owned(), json!(invocation.fingerprint));
        payload.insert("capability_id".to_owned(), json!(invocation.capability_id));
        payload.insert("operation".to_owned(), json!(invocation.operation));
        if let serde_json::Value::Object(extra) = extra {
            payload.extend(extra);
        }
        let now = chrono::Utc::now();
        bus.publish(Event {
            id: uuid::Uuid::new_v4().to_string(),
            source_connector_id: invocation.connector_id.clone(),
            event_type,
            device_id: None,
            occurred_at: now,
            received_at: now,
            payload,
            capabilities_observed: Default::default(),
        });
    }
}

#[cfg(test)]
mod dispatcher_tests;
