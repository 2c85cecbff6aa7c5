// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Fabric: a connector runtime, event bus, rule engine, action
//! dispatcher, and spatial correlation core for security/IoT camera
//! systems (spec.md §1).

pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connector;
pub mod connector_registry;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod handle;
pub mod registry;
pub mod rules;

use tracing::info;

use crate::config::FabricConfig;
use crate::handle::FabricHandle;

/// Run the fabric until its shutdown token is cancelled. Connectors are not
/// wired here: constructing and registering them is glue the binary's
/// surrounding deployment owns (spec §1 Non-goals — vendor-specific REST
/// wrapper glue and the setup wizard are out of scope).
pub async fn run(config: FabricConfig) -> anyhow::Result<()> {
    let handle = FabricHandle::new(&config, Vec::new());
    info!(
        action_workers = config.action_workers,
        event_queue_size = config.event_queue_size,
        "event fabric started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown();
    Ok(())
}
