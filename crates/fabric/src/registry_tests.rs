// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

fn snapshot_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor {
        id: "camera:snapshot".into(),
        name: "Camera snapshot".into(),
        operations: vec![OperationSpec {
            name: "get",
            params: vec![ParamSpec { name: "quality", schema: ParamSchema::Enum(&["low", "high"]), required: false }],
        }],
        requires_connection: true,
    }
}

fn registry() -> CapabilityRegistry {
    CapabilityRegistry::from_descriptors(vec![snapshot_descriptor()])
}

fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match v {
        serde_json::Value::Object(m) => m,
        _ => panic!("expected object"),
    }
}

#[test]
fn lookup_known_capability() {
    let reg = registry();
    assert!(reg.lookup("camera:snapshot").is_some());
    assert!(reg.lookup("camera:unknown").is_none());
}

#[test]
fn validate_unknown_capability() {
    let reg = registry();
    let params = obj(json!({}));
    assert!(matches!(
        reg.validate("camera:missing", "get", &params),
        Err(ValidationOutcome::UnknownCapability)
    ));
}

#[test]
fn validate_unknown_operation() {
    let reg = registry();
    let params = obj(json!({}));
    assert!(matches!(
        reg.validate("camera:snapshot", "delete", &params),
        Err(ValidationOutcome::UnknownOperation)
    ));
}

#[test]
fn validate_accepts_missing_optional_param() {
    let reg = registry();
    let params = obj(json!({}));
    assert!(reg.validate("camera:snapshot", "get", &params).is_ok());
}

#[test]
fn validate_rejects_disallowed_enum_value() {
    let reg = registry();
    let params = obj(json!({"quality": "ultra"}));
    assert!(matches!(
        reg.validate("camera:snapshot", "get", &params),
        Err(ValidationOutcome::Param(ParamError::NotAllowed { .. }))
    ));
}

#[test]
fn validate_accepts_allowed_enum_value() {
    let reg = registry();
    let params = obj(json!({"quality": "high"}));
    assert!(reg.validate("camera:snapshot", "get", &params).is_ok());
}

#[test]
fn validate_rejects_missing_required_param() {
    let descriptor = CapabilityDescriptor {
        id: "ptz:move".into(),
        name: "PTZ move".into(),
        operations: vec![OperationSpec {
            name: "move",
            params: vec![ParamSpec { name: "direction", schema: ParamSchema::String, required: true }],
        }],
        requires_connection: true,
    };
    let reg = CapabilityRegistry::from_descriptors(vec![descriptor]);
    let params = obj(json!({}));
    assert!(matches!(
        reg.validate("ptz:move", "move", &params),
        Err(ValidationOutcome::Param(ParamError::Missing(_)))
    ));
}
