// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composition root bundling the fabric's live components, analogous to
//! the teacher's `MuxState` (spec §5 "Supplemented features").

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::FabricConfig;
use crate::connector_registry::ConnectorRegistry;
use crate::correlation::CorrelationCore;
use crate::dispatcher::{ActionDispatcher, ActionQueue};
use crate::fingerprint::InFlightRegistry;
use crate::rules::{Rule, RuleEngine};

/// Everything a running fabric process holds, handed to whichever external
/// admin surface exists (out of scope to implement here, spec §1/§5).
pub struct FabricHandle {
    pub connectors: Arc<ConnectorRegistry>,
    pub bus: EventBus,
    pub rules: Arc<RuleEngine>,
    pub action_queue: Arc<ActionQueue>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub correlation: Arc<CorrelationCore>,
    pub in_flight: Arc<InFlightRegistry>,
    pub shutdown: CancellationToken,
}

impl FabricHandle {
    /// Wire the bus, connector registry, rule engine, action dispatcher,
    /// and correlation core from one `FabricConfig`, matching how
    /// `coop_mux::run` builds its `MuxState` in one place (spec §5).
    pub fn new(config: &FabricConfig, rules: Vec<Rule>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let clock = Clock::new();
        let bus = EventBus::with_capacity(config.event_queue_size, config.sub_queue_size, config.backpressure());
        let connectors = Arc::new(ConnectorRegistry::new());
        let in_flight = Arc::new(InFlightRegistry::new());

        let (dispatcher, action_queue) =
            ActionDispatcher::spawn(config.dispatcher_config(), Arc::clone(&connectors), bus.clone(), Arc::clone(&in_flight));
        let rule_engine = RuleEngine::spawn(rules, &bus, Arc::clone(&action_queue), Arc::clone(&in_flight));

        let correlation = CorrelationCore::new(bus.clone(), config.correlation_config());
        correlation.spawn(&clock);

        Arc::new(Self {
            connectors,
            bus,
            rules: rule_engine,
            action_queue,
            dispatcher,
            correlation,
            in_flight,
            shutdown,
        })
    }

    /// Cancel every supervisory task the components spawned: connector
    /// reconnect loops, bus dispatcher/subscriber workers, dispatcher
    /// worker pool, correlation retention sweep (spec §5 "Graceful
    /// shutdown").
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.bus.shutdown();
    }
}

#[cfg(test)]
mod handle_tests;
