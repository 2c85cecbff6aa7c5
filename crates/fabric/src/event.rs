// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The fabric's unit of data (spec §3 "Event").

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed-vocabulary event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Motion,
    #[serde(rename = "smart.detect.zone")]
    SmartDetectZone,
    #[serde(rename = "smart.detect.line")]
    SmartDetectLine,
    #[serde(rename = "smart.detect.loiter")]
    SmartDetectLoiter,
    Ring,
    Recording,
    Connection,
    #[serde(rename = "device.status")]
    DeviceStatus,
    /// Internal meta-event: a previously unseen `type` value was observed.
    #[serde(rename = "event_type.discovered")]
    EventTypeDiscovered,
    /// Internal meta-event: a previously unseen payload key was observed.
    #[serde(rename = "fields.discovered")]
    FieldsDiscovered,
    /// Internal meta-event: an action invocation completed successfully.
    #[serde(rename = "action.completed")]
    ActionCompleted,
    /// Internal meta-event: an action invocation failed terminally.
    #[serde(rename = "action.failed")]
    ActionFailed,
    /// Internal meta-event: a transit speed was computed (C8).
    #[serde(rename = "speed.calculated")]
    SpeedCalculated,
    /// Internal meta-event: a transit speed exceeded a configured limit (C8).
    #[serde(rename = "speed.alert")]
    SpeedAlert,
    Generic,
}

impl EventType {
    /// Per-event-type device-id key precedence, resolving the Open Question
    /// in spec §9: the source stores `cameraId` under different keys
    /// (`cameraId`, `id`, `device`) and the precedence is a declared
    /// mapping, not a heuristic. All currently known event types share the
    /// same precedence; this function is the single place that decision
    /// lives, so a future vendor-specific event type can override it.
    pub fn device_id_precedence(self) -> &'static [&'static str] {
        &["cameraId", "id", "device"]
    }
}

/// The fabric's normalized event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source_connector_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub device_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Map<String, Value>,
    pub capabilities_observed: BTreeSet<String>,
}

impl Event {
    /// Canonicalize `device_id` from the payload using the event type's
    /// declared key precedence (spec §9 Open Question resolution).
    pub fn extract_device_id(event_type: EventType, payload: &serde_json::Map<String, Value>) -> Option<String> {
        for key in event_type.device_id_precedence() {
            if let Some(v) = payload.get(*key).and_then(Value::as_str) {
                return Some(v.to_owned());
            }
        }
        None
    }

    /// Derive `capabilities_observed` tags from payload content (spec §4.3
    /// step 5). Pure function of the payload; never mutates it.
    pub fn derive_capabilities(payload: &serde_json::Map<String, Value>) -> BTreeSet<String> {
        let mut caps = BTreeSet::new();

        if let Some(types) = payload.get("smartDetectTypes").and_then(Value::as_array) {
            for t in types {
                if let Some(s) = t.as_str() {
                    caps.insert(format!("smartDetect:{s}"));
                }
            }
        }
        if payload.contains_key("lineCrossing") || payload.get("type").and_then(Value::as_str) == Some("smart.detect.line") {
            caps.insert("lineCrossing".to_owned());
        }
        if payload.contains_key("zoneId") || payload.get("type").and_then(Value::as_str) == Some("smart.detect.zone") {
            caps.insert("zoneDetection".to_owned());
        }
        if payload.get("motion").is_some() || payload.get("type").and_then(Value::as_str) == Some("motion") {
            caps.insert("motionDetection".to_owned());
        }
        if payload.contains_key("plate") || payload.contains_key("licensePlate") {
            caps.insert("licensePlateDetection".to_owned());
        }
        if payload.contains_key("audioType") {
            caps.insert("audioDetection".to_owned());
        }

        caps
    }

    /// Whether `received_at - occurred_at >= -clock_skew_tolerance` (spec
    /// §3 invariant). Negative tolerance is never allowed to flip the sign.
    pub fn within_skew_tolerance(&self, clock_skew_tolerance: chrono::Duration) -> bool {
        self.received_at >= self.occurred_at - clock_skew_tolerance
    }
}

#[cfg(test)]
mod event_tests;
