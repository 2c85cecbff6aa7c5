// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connector instance registry: the `registry.list_connectors()` /
//! `registry.create(config)` surface from spec §6, addressed by id so the
//! Rule Engine (C6) and Action Dispatcher (C7) never hold a direct
//! reference to a connector — only the Registry does, inverting the
//! cyclic connector/manager references the spec's §9 design notes flag.
//!
//! Construction (`create`) is a glue concern of connector-specific
//! factories out of scope here (spec §1); this registry only tracks
//! already-constructed instances and exposes lookup by id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connector::{Connector, ConnectorState};

/// Holds every live connector instance by id. Connectors never hold a
/// reference back to this registry — the inversion from spec §9's
/// "cyclic references between connectors and an entity manager" note.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-constructed connector under its id, overwriting
    /// any previous instance with the same id.
    pub async fn register(&self, connector: Arc<dyn Connector>) {
        self.connectors.write().await.insert(connector.id().to_owned(), connector);
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.read().await.get(id).cloned()
    }

    /// `registry.list_connectors()`: enumerate instances and their current
    /// state (spec §6).
    pub async fn list_connectors(&self) -> Vec<(String, ConnectorState)> {
        let connectors: Vec<Arc<dyn Connector>> = self.connectors.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(connectors.len());
        for c in connectors {
            out.push((c.id().to_owned(), c.state().await));
        }
        out
    }
}

#[cfg(test)]
mod connector_registry_tests;
