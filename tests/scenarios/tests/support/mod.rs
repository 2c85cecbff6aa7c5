// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared black-box test fixtures: a scriptable [`Transport`] double and a
//! connector config tuned for fast, deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use fabric::connector::{ConnectorConfig, Transport};
use fabric::error::{ConnectError, ExecuteError};

/// A [`Transport`] whose `connect()` outcomes and inbound messages are
/// scripted from the test, mirroring the in-crate fixture used by
/// `connector_tests.rs` but exposed here for black-box use.
pub struct FakeTransport {
    connect_calls: AtomicU32,
    connect_results: Mutex<VecDeque<Result<(), ConnectError>>>,
    inbound_tx: UnboundedSender<Option<Value>>,
    inbound_rx: tokio::sync::Mutex<UnboundedReceiver<Option<Value>>>,
}

impl FakeTransport {
    /// Build a fake transport plus the sender the test uses to push
    /// inbound messages (or `None` to simulate the session ending).
    pub fn new() -> (Arc<Self>, UnboundedSender<Option<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connect_calls: AtomicU32::new(0),
            connect_results: Mutex::new(VecDeque::new()),
            inbound_tx: tx.clone(),
            inbound_rx: tokio::sync::Mutex::new(rx),
        });
        (transport, tx)
    }

    /// Queue the next `connect()` outcome; unscripted calls succeed.
    #[allow(dead_code)]
    pub fn push_connect_result(&self, result: Result<(), ConnectError>) {
        self.connect_results.lock().push_back(result);
    }

    #[allow(dead_code)]
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        self.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) {
        let _ = &self.inbound_tx;
    }

    async fn execute_raw(&self, _capability_id: &str, _operation: &str, _parameters: &Map<String, Value>) -> Result<Value, ExecuteError> {
        Ok(Value::Null)
    }

    async fn recv(&self) -> Option<Value> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.flatten()
    }

    async fn send_heartbeat(&self) -> bool {
        true
    }
}

/// A [`ConnectorConfig`] with short timeouts/backoff so reconnect and
/// heartbeat scenarios complete quickly under test.
pub fn fast_connector_config() -> ConnectorConfig {
    ConnectorConfig {
        t_connect: Duration::from_millis(200),
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        max_reconnect_attempts: 5,
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_timeout: Duration::from_secs(3600),
        ..ConnectorConfig::default()
    }
}
