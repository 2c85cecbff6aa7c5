// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use super::*;

#[derive(Parser)]
struct Harness {
    #[command(flatten)]
    config: FabricConfig,
}

fn test_config() -> FabricConfig {
    Harness::parse_from(["fabric"]).config
}

#[tokio::test]
async fn builds_with_no_rules_and_accepts_shutdown() {
    let handle = FabricHandle::new(&test_config(), vec![]);
    assert_eq!(handle.dispatcher.completed_count(), 0);
    assert_eq!(handle.connectors.list_connectors().await.len(), 0);
    handle.shutdown();
}

#[tokio::test]
async fn correlation_core_is_reachable_and_registers_points() {
    let handle = FabricHandle::new(&test_config(), vec![]);
    handle.correlation.register_detection_point(crate::correlation::DetectionPoint {
        id: "gate-1".to_owned(),
        position: crate::correlation::Position::Planar { x: 0.0, y: 0.0 },
        direction: None,
        speed_limit: None,
        active: true,
    });
    assert!(handle.correlation.detection_point("gate-1").is_some());
    handle.shutdown();
}
