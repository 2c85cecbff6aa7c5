// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rule Engine (C6): predicate matching on events, producing bounded
//! action invocations for the dispatcher (C7).
//!
//! All rules evaluate independently for each event — no priority, no
//! short-circuiting across rules. The engine holds a single bus
//! subscription with a compiled union predicate spanning all enabled
//! rules, matching spec §4.6's "single bus subscription" design rather
//! than one subscription per rule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::bus::{EventBus, Filter};
use crate::dispatcher::ActionQueue;
use crate::event::Event;
use crate::fingerprint::InFlightRegistry;

/// `(id, connector_id, capability_id, operation, parameters, deadline,
/// attempt)` — produced by C6, consumed by C7 (spec §3).
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub id: String,
    pub fingerprint: String,
    pub connector_id: String,
    pub capability_id: String,
    pub operation: String,
    pub parameters: Map<String, Value>,
    pub deadline: Instant,
    pub attempt: u32,
}

/// Derives the target and parameters of an action invocation from a
/// matched event. A plain function pointer/closure, not a trait object
/// hierarchy — rules differ only in data, never in behavior.
pub type ActionTemplate = Arc<dyn Fn(&Event) -> (String, String, String, Map<String, Value>) + Send + Sync>;

/// `{key_fn, window}` — within `window`, only one invocation per
/// `key_fn(event)` is produced; others are suppressed and counted.
#[derive(Clone)]
pub struct Throttle {
    pub key_fn: Arc<dyn Fn(&Event) -> String + Send + Sync>,
    pub window: Duration,
}

/// `(predicate, action_template, throttle)` (spec §4.6).
pub struct Rule {
    pub id: String,
    pub predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
    pub action_template: ActionTemplate,
    pub throttle: Option<Throttle>,
    pub enabled: bool,
    last_fired: Mutex<HashMap<String, Instant>>,
    pub suppressed_count: AtomicU64,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
        action_template: ActionTemplate,
        throttle: Option<Throttle>,
    ) -> Self {
        Self {
            id: id.into(),
            predicate: Arc::new(predicate),
            action_template,
            throttle,
            enabled: true,
            last_fired: Mutex::new(HashMap::new()),
            suppressed_count: AtomicU64::new(0),
        }
    }

    /// Predicate -> throttle check -> action emission, strictly sequential
    /// for this one rule (spec §4.6 "Evaluation order").
    fn evaluate(&self, event: &Event) -> Option<(String, String, String, Map<String, Value>)> {
        if !self.enabled || !(self.predicate)(event) {
            return None;
        }
        if let Some(throttle) = &self.throttle {
            let key = (throttle.key_fn)(event);
            let mut fired = self.last_fired.lock();
            if let Some(last) = fired.get(&key) {
                if last.elapsed() < throttle.window {
                    self.suppressed_count.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
            fired.insert(key, Instant::now());
        }
        Some((self.action_template)(event))
    }
}

/// Canonical fingerprint: `hash(connector_id, capability_id, operation,
/// canonical(parameters))` (spec §4.6, glossary). `serde_json::Map` is
/// already key-sorted (`preserve_order` is not enabled in this workspace),
/// so `to_string` is a stable canonical form.
pub fn fingerprint(connector_id: &str, capability_id: &str, operation: &str, parameters: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(parameters).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(connector_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(capability_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Default action deadline when a rule's template does not override it
/// (the action dispatcher additionally caps this at its own default, spec
/// §4.7 step 2).
const DEFAULT_ACTION_DEADLINE: Duration = Duration::from_secs(10);

pub struct RuleEngine {
    rules: Arc<Vec<Rule>>,
    in_flight: Arc<InFlightRegistry>,
}

impl RuleEngine {
    /// Subscribe to `bus` with a compiled union predicate over every
    /// enabled rule, forwarding qualifying invocations to `action_tx`.
    pub fn spawn(
        rules: Vec<Rule>,
        bus: &EventBus,
        action_queue: Arc<ActionQueue>,
        in_flight: Arc<InFlightRegistry>,
    ) -> Arc<Self> {
        let rules = Arc::new(rules);
        let engine = Arc::new(Self { rules: Arc::clone(&rules), in_flight: Arc::clone(&in_flight) });

        let union_rules = Arc::clone(&rules);
        let filter = Filter::new(move |event| union_rules.iter().any(|r| r.enabled && (r.predicate)(event)));

        let sink_rules = Arc::clone(&rules);
        let sink_in_flight = Arc::clone(&in_flight);
        let sink: crate::bus::Sink = Arc::new(move |event| {
            let rules = Arc::clone(&sink_rules);
            let in_flight = Arc::clone(&sink_in_flight);
            let action_queue = Arc::clone(&action_queue);
            Box::pin(async move {
                // Every rule evaluates independently; failures in one
                // predicate never interrupt the others (spec §4.6).
                for rule in rules.iter() {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rule.evaluate(&event)));
                    let Ok(Some((connector_id, capability_id, operation, parameters))) = outcome else {
                        if outcome.is_err() {
                            tracing::warn!(rule_id = %rule.id, "rule predicate panicked, treated as non-match");
                        }
                        continue;
                    };

                    let fp = fingerprint(&connector_id, &capability_id, &operation, &parameters);
                    if !in_flight.try_begin(&fp) {
                        // Coalesced: an action with this fingerprint is
                        // already in flight (spec §4.6 fingerprinting).
                        continue;
                    }

                    let invocation = ActionInvocation {
                        id: uuid::Uuid::new_v4().to_string(),
                        fingerprint: fp.clone(),
                        connector_id,
                        capability_id,
                        operation,
                        parameters,
                        deadline: Instant::now() + DEFAULT_ACTION_DEADLINE,
                        attempt: 0,
                    };

                    if !action_queue.try_enqueue(invocation) {
                        // Dispatcher queue is full; the fingerprint was
                        // marked in-flight but will never be picked up, so
                        // release it immediately rather than wedging it.
                        in_flight.finish(&fp);
                        tracing::warn!(rule_id = %rule.id, "dispatcher queue full, invocation dropped");
                    }
                }
            })
        });

        bus.subscribe(filter, sink, crate::bus::DropPolicy::DropOldest, None);
        engine
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn in_flight(&self) -> &Arc<InFlightRegistry> {
        &self.in_flight
    }
}

#[cfg(test)]
mod rules_tests;
