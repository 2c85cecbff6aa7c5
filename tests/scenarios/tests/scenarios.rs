// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Black-box end-to-end scenarios against the public `fabric` API, covering
//! spec.md §8's S1-S6 literal scenarios, the round-trip/idempotence
//! properties, and the boundary tests.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use fabric::bus::{DropPolicy, EventBus, Filter, Sink};
use fabric::clock::{Backoff, Clock};
use fabric::codec::{self, DataPayload};
use fabric::connector::{ConnectorRuntime, ConnectorState};
use fabric::correlation::{CorrelationConfig, CorrelationCore, DetectionPoint, Position};
use fabric::event::{Event, EventType};
use fabric::registry::CapabilityRegistry;

use support::FakeTransport;

fn collector() -> (Sink, Arc<AsyncMutex<Vec<Event>>>) {
    let collected = Arc::new(AsyncMutex::new(Vec::new()));
    let c = Arc::clone(&collected);
    let sink: Sink = Arc::new(move |event| {
        let c = Arc::clone(&c);
        Box::pin(async move {
            c.lock().await.push(event);
        })
    });
    (sink, collected)
}

fn crossing_event(source: &str, t: chrono::DateTime<chrono::Utc>, key_field: &str, key: &str, point: &str) -> Event {
    let mut payload = serde_json::Map::new();
    payload.insert(key_field.to_owned(), json!(key));
    payload.insert("detection_point_id".to_owned(), json!(point));
    let mut caps = std::collections::BTreeSet::new();
    caps.insert("lineCrossing".to_owned());
    Event {
        id: uuid::Uuid::new_v4().to_string(),
        source_connector_id: source.to_owned(),
        event_type: EventType::SmartDetectLine,
        device_id: None,
        occurred_at: t,
        received_at: t,
        payload,
        capabilities_observed: caps,
    }
}

// -- S1: normal transit, no alert --------------------------------------------

#[tokio::test]
async fn s1_normal_transit_produces_speed_with_no_alert() {
    let bus = EventBus::new();
    let clock = Clock::new();
    let core = CorrelationCore::new(bus.clone(), CorrelationConfig::default());
    core.register_detection_point(DetectionPoint {
        id: "A".to_owned(),
        position: Position::Geographic { lat: 51.5074, lon: -0.1278 },
        direction: None,
        // v ~= 30.7 km/h: the limit must clear that to genuinely model
        // "under the limit" rather than tripping consider_pair's `v >
        // limit` branch.
        speed_limit: Some(35.0),
        active: true,
    });
    core.register_detection_point(DetectionPoint {
        id: "B".to_owned(),
        position: Position::Geographic { lat: 51.5120, lon: -0.1278 },
        direction: None,
        speed_limit: Some(35.0),
        active: true,
    });
    core.spawn(&clock);

    let (calc_sink, calculated) = collector();
    bus.subscribe(Filter::new(|e| e.event_type == EventType::SpeedCalculated), calc_sink, DropPolicy::DropOldest, None);
    let (alert_sink, alerts) = collector();
    bus.subscribe(Filter::new(|e| e.event_type == EventType::SpeedAlert), alert_sink, DropPolicy::DropOldest, None);

    let t0 = chrono::Utc::now();
    bus.publish(crossing_event("nvr-1", t0, "tracking_id", "ABC123", "A"));
    bus.publish(crossing_event("nvr-1", t0 + chrono::Duration::seconds(60), "tracking_id", "ABC123", "B"));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let got = calculated.lock().await;
    assert_eq!(got.len(), 1, "expected exactly one speed.calculated event");
    let v = got[0].payload.get("v").and_then(serde_json::Value::as_f64).unwrap();
    assert!((v - 30.7).abs() < 1.0, "expected v ~= 30.7 km/h, got {v}");
    assert!(alerts.lock().await.is_empty(), "no alert expected under the speed limit");
}

// -- S2: speeding, alert ------------------------------------------------------

#[tokio::test]
async fn s2_speeding_transit_produces_alert_with_expected_excess() {
    let bus = EventBus::new();
    let clock = Clock::new();
    let core = CorrelationCore::new(bus.clone(), CorrelationConfig::default());
    core.register_detection_point(DetectionPoint {
        id: "A".to_owned(),
        position: Position::Geographic { lat: 51.5074, lon: -0.1278 },
        direction: None,
        speed_limit: Some(30.0),
        active: true,
    });
    core.register_detection_point(DetectionPoint {
        id: "B".to_owned(),
        position: Position::Geographic { lat: 51.5120, lon: -0.1278 },
        direction: None,
        speed_limit: Some(30.0),
        active: true,
    });
    core.spawn(&clock);

    let (alert_sink, alerts) = collector();
    bus.subscribe(Filter::new(|e| e.event_type == EventType::SpeedAlert), alert_sink, DropPolicy::DropOldest, None);

    let t0 = chrono::Utc::now();
    bus.publish(crossing_event("nvr-1", t0, "tracking_id", "XYZ789", "A"));
    bus.publish(crossing_event("nvr-1", t0 + chrono::Duration::seconds(10), "tracking_id", "XYZ789", "B"));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let got = alerts.lock().await;
    assert_eq!(got.len(), 1, "expected exactly one speed.alert event");
    let v = got[0].payload.get("v").and_then(serde_json::Value::as_f64).unwrap();
    let excess = got[0].payload.get("excess").and_then(serde_json::Value::as_f64).unwrap();
    assert!((v - 184.0).abs() < 2.0, "expected v ~= 184 km/h, got {v}");
    assert!((excess - 154.0).abs() < 2.0, "expected excess ~= 154, got {excess}");
}

// -- S3: below minimum speed, gated by v_min ----------------------------------

#[tokio::test]
async fn s3_below_default_minimum_speed_is_still_emitted_at_v_min_5() {
    let bus = EventBus::new();
    let clock = Clock::new();
    let core = CorrelationCore::new(bus.clone(), CorrelationConfig::default());
    core.register_detection_point(DetectionPoint {
        id: "A".to_owned(),
        position: Position::Geographic { lat: 51.5074, lon: -0.1278 },
        direction: None,
        speed_limit: None,
        active: true,
    });
    core.register_detection_point(DetectionPoint {
        id: "B".to_owned(),
        position: Position::Geographic { lat: 51.5120, lon: -0.1278 },
        direction: None,
        speed_limit: None,
        active: true,
    });
    core.spawn(&clock);

    let (calc_sink, calculated) = collector();
    bus.subscribe(Filter::new(|e| e.event_type == EventType::SpeedCalculated), calc_sink, DropPolicy::DropOldest, None);

    let t0 = chrono::Utc::now();
    bus.publish(crossing_event("nvr-1", t0, "tracking_id", "SLOW1", "A"));
    bus.publish(crossing_event("nvr-1", t0 + chrono::Duration::seconds(360), "tracking_id", "SLOW1", "B"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let got = calculated.lock().await;
    assert_eq!(got.len(), 1);
    let v = got[0].payload.get("v").and_then(serde_json::Value::as_f64).unwrap();
    assert!((v - 5.11).abs() < 0.5, "expected v ~= 5.11 km/h, got {v}");
}

#[tokio::test]
async fn s3_below_raised_minimum_speed_is_suppressed_at_v_min_6() {
    let bus = EventBus::new();
    let clock = Clock::new();
    let mut config = CorrelationConfig::default();
    config.v_min = 6.0;
    let core = CorrelationCore::new(bus.clone(), config);
    core.register_detection_point(DetectionPoint {
        id: "A".to_owned(),
        position: Position::Geographic { lat: 51.5074, lon: -0.1278 },
        direction: None,
        speed_limit: None,
        active: true,
    });
    core.register_detection_point(DetectionPoint {
        id: "B".to_owned(),
        position: Position::Geographic { lat: 51.5120, lon: -0.1278 },
        direction: None,
        speed_limit: None,
        active: true,
    });
    core.spawn(&clock);

    let t0 = chrono::Utc::now();
    bus.publish(crossing_event("nvr-1", t0, "tracking_id", "SLOW2", "A"));
    bus.publish(crossing_event("nvr-1", t0 + chrono::Duration::seconds(360), "tracking_id", "SLOW2", "B"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(core.speed_calculated_count(), 0, "v_min=6 should suppress a ~5.11 km/h sample");
}

// -- S4: duplicate event ------------------------------------------------------

#[tokio::test]
async fn s4_duplicate_event_is_delivered_once_with_one_dedup_drop() {
    let (transport, tx) = FakeTransport::new();
    let bus = EventBus::new();
    let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![]));
    let runtime = ConnectorRuntime::new(
        "conn-c1",
        Arc::try_unwrap(transport).unwrap_or_else(|_| unreachable!()),
        registry,
        bus.clone(),
        Clock::new(),
        support::fast_connector_config(),
    );
    runtime.connect().await.expect("connect should succeed");

    let (sink, collected) = collector();
    bus.subscribe(Filter::by_source("conn-c1"), sink, DropPolicy::DropOldest, None);

    let envelope = json!({ "type": "motion", "cameraId": "device-1", "eventId": "E1" });
    tx.send(Some(envelope.clone())).unwrap();
    tx.send(Some(envelope)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collected.lock().await.len(), 1, "subscriber should see the duplicate exactly once");
    assert_eq!(runtime.counters.dedup_drops.load(Ordering::Relaxed), 1);
}

// -- S5: backpressure ----------------------------------------------------------

#[tokio::test]
async fn s5_drop_oldest_backpressure_keeps_the_latest_four() {
    let bus = EventBus::new();
    let started = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let collected = Arc::new(AsyncMutex::new(Vec::new()));
    let first_call = Arc::new(AtomicU32::new(0));

    let s = Arc::clone(&started);
    let r = Arc::clone(&release);
    let c = Arc::clone(&collected);
    let fc = Arc::clone(&first_call);
    let sink: Sink = Arc::new(move |event| {
        let s = Arc::clone(&s);
        let r = Arc::clone(&r);
        let c = Arc::clone(&c);
        let fc = Arc::clone(&fc);
        Box::pin(async move {
            if fc.fetch_add(1, Ordering::Relaxed) == 0 {
                s.notify_one();
                r.notified().await;
            }
            c.lock().await.push(event);
        })
    });

    let handle = bus.subscribe(Filter::any(), sink, DropPolicy::DropOldest, Some(4));

    bus.publish(make_plain_event("cam-s5", "e0"));
    started.notified().await; // e0's delivery is now blocked

    for i in 1..=10 {
        bus.publish(make_plain_event("cam-s5", &format!("e{i}")));
    }
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let got = collected.lock().await;
    let ids: Vec<&str> = got.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.first(), Some(&"e0"), "the in-flight event still completes delivery");
    assert!(ids.contains(&"e7") && ids.contains(&"e10"), "the last four publishes should survive drop-oldest: {ids:?}");
    assert_eq!(bus.subscription_overflow(handle.id()), 6, "events e1..=e6 should have been dropped (6 overflow)");
}

fn make_plain_event(source: &str, id: &str) -> Event {
    let now = chrono::Utc::now();
    Event {
        id: id.to_owned(),
        source_connector_id: source.to_owned(),
        event_type: EventType::Motion,
        device_id: None,
        occurred_at: now,
        received_at: now,
        payload: Default::default(),
        capabilities_observed: Default::default(),
    }
}

// -- S6: reconnect after transport drop ---------------------------------------

#[tokio::test]
async fn s6_reconnects_after_transport_drop_and_execute_fails_meanwhile() {
    let (transport, tx) = FakeTransport::new();
    let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![]));
    // A slower backoff than the other scenarios' shared config, so there is
    // a reliable window where the connector is provably not yet Connected
    // again (as opposed to racing a near-instant reconnect).
    let config = fabric::connector::ConnectorConfig {
        backoff_base: Duration::from_millis(100),
        backoff_cap: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_timeout: Duration::from_secs(3600),
        ..support::fast_connector_config()
    };
    let runtime = ConnectorRuntime::new("conn-s6", Arc::try_unwrap(transport).unwrap_or_else(|_| unreachable!()), registry, EventBus::new(), Clock::new(), config);
    runtime.connect().await.expect("initial connect should succeed");
    assert_eq!(runtime.state().await, ConnectorState::Connected);

    // Drop the transport: the reader task's `recv()` returns `None`.
    tx.send(None).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ne!(runtime.state().await, ConnectorState::Connected, "connector should be mid-reconnect, not Connected");
    // No call ever wedges: an execute() issued while degraded/reconnecting
    // surfaces NotConnected promptly rather than hanging.
    let deadline = std::time::Instant::now() + Duration::from_millis(50);
    let result = runtime.execute("camera", "snapshot", serde_json::Map::new(), deadline).await;
    assert!(matches!(result, Err(fabric::error::ExecuteError::NotConnected)));

    // Give the reconnect loop enough bounded time to succeed again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(runtime.state().await, ConnectorState::Connected, "connector should have reconnected");
}

// -- Round-trip / idempotence ---------------------------------------------------

#[tokio::test]
async fn codec_round_trips_a_two_frame_message() {
    let action = json!({ "action": "update", "modelKey": "camera", "id": "cam-1" });
    let data = DataPayload::Json(json!({ "temperature": 41.2 }));
    let encoded = codec::encode(&action, Some(&data), false);
    let decoded = codec::decode(&encoded).expect("decode should succeed");
    assert_eq!(decoded.action, action);
    assert_eq!(decoded.data, Some(data));
}

#[tokio::test]
async fn codec_round_trips_deflated_data_frame() {
    let action = json!({ "action": "message" });
    let data = DataPayload::Text("hello vendor event stream".repeat(20));
    let encoded = codec::encode(&action, Some(&data), true);
    let decoded = codec::decode(&encoded).expect("decode should succeed");
    assert_eq!(decoded.data, Some(data));
}

#[tokio::test]
async fn connect_disconnect_connect_converges_to_connected() {
    let (transport, _tx) = FakeTransport::new();
    let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![]));
    let runtime = ConnectorRuntime::new(
        "conn-idem",
        Arc::try_unwrap(transport).unwrap_or_else(|_| unreachable!()),
        registry,
        EventBus::new(),
        Clock::new(),
        support::fast_connector_config(),
    );
    runtime.connect().await.expect("connect");
    assert_eq!(runtime.state().await, ConnectorState::Connected);
    runtime.disconnect().await;
    assert_eq!(runtime.state().await, ConnectorState::Idle);
    runtime.connect().await.expect("reconnect from idle");
    assert_eq!(runtime.state().await, ConnectorState::Connected);
}

// -- Boundary tests -------------------------------------------------------------

#[tokio::test]
async fn frame_with_zero_payload_size_is_not_an_error() {
    let mut buf = vec![1u8, 1, 0, 0, 0, 0, 0, 0]; // packet_type=action, format=json, size=0
    buf.extend_from_slice(b"\x00\x01\x00\x02"); // garbage trailing bytes so it is not valid whole-buffer JSON
    let decoded = codec::decode(&buf).expect("zero-size action frame must decode, not error");
    assert_eq!(decoded.action, json!({ "action": "message" }));
}

#[tokio::test]
async fn frame_truncated_by_one_byte_yields_protocol_error() {
    let full = codec::encode(&json!({ "action": "update", "id": "x" }), None, false);
    let truncated = &full[..full.len() - 1];
    let err = codec::decode(truncated).expect_err("truncated action payload must fail");
    assert!(matches!(err, fabric::error::FrameError::PayloadOverrun { .. }));
}

#[tokio::test]
async fn queue_at_capacity_plus_one_publish_drops_exactly_one() {
    let bus = EventBus::with_capacity(4, 256, Duration::from_millis(50));
    for i in 0..5 {
        bus.publish(make_plain_event("cam-bound", &format!("e{i}")));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bus.source_overflow("cam-bound"), 1);
}

#[test]
fn backoff_delays_stay_within_the_documented_bounds_and_cap() {
    let base = Duration::from_secs(1);
    let cap = Duration::from_secs(30);
    for n in 0..12u32 {
        let delay = Backoff::delay_for(base, cap, n);
        let unjittered = base.saturating_mul(2u32.saturating_pow(n.min(20))).min(cap);
        let lower = unjittered.mul_f64(0.5);
        assert!(delay >= lower, "delay {delay:?} below lower bound {lower:?} at n={n}");
        assert!(delay <= unjittered, "delay {delay:?} above unjittered bound {unjittered:?} at n={n}");
        assert!(delay <= cap, "delay {delay:?} exceeds cap {cap:?} at n={n}");
    }
}

// -- Cross-component: rule engine -> dispatcher --------------------------------

#[tokio::test]
async fn rule_match_drives_a_dispatched_action_that_completes() {
    use fabric::connector::Connector;
    use fabric::connector_registry::ConnectorRegistry;
    use fabric::dispatcher::{ActionDispatcher, ActionDispatcherConfig};
    use fabric::fingerprint::InFlightRegistry;
    use fabric::registry::{CapabilityDescriptor, OperationSpec};
    use fabric::rules::{Rule, RuleEngine};

    let bus = EventBus::new();
    let connectors = Arc::new(ConnectorRegistry::new());

    let (transport, _tx) = FakeTransport::new();
    // `execute` validates against the capability table before dispatching,
    // so the "notify"/"send" pair the rule below targets must be declared
    // or the call fails with UnknownCapability before FakeTransport ever
    // sees it.
    let registry = Arc::new(CapabilityRegistry::from_descriptors(vec![CapabilityDescriptor {
        id: "notify".to_owned(),
        name: "Notify".to_owned(),
        operations: vec![OperationSpec { name: "send", params: vec![] }],
        requires_connection: true,
    }]));
    let runtime = ConnectorRuntime::new(
        "doorbell-1",
        Arc::try_unwrap(transport).unwrap_or_else(|_| unreachable!()),
        registry,
        bus.clone(),
        Clock::new(),
        support::fast_connector_config(),
    );
    runtime.connect().await.expect("connect");
    connectors.register(runtime as Arc<dyn Connector>).await;

    let in_flight = Arc::new(InFlightRegistry::new());
    let (dispatcher, action_queue) =
        ActionDispatcher::spawn(ActionDispatcherConfig::default(), Arc::clone(&connectors), bus.clone(), Arc::clone(&in_flight));

    let rule = Rule::new(
        "ring-notify",
        |e: &Event| e.event_type == EventType::Ring,
        Arc::new(|e: &Event| {
            ("doorbell-1".to_owned(), "notify".to_owned(), "send".to_owned(), {
                let mut p = serde_json::Map::new();
                p.insert("device_id".to_owned(), json!(e.device_id));
                p
            })
        }),
        None,
    );
    let _engine = RuleEngine::spawn(vec![rule], &bus, Arc::clone(&action_queue), in_flight);

    let (sink, completed) = collector();
    bus.subscribe(Filter::new(|e| e.event_type == EventType::ActionCompleted), sink, DropPolicy::DropOldest, None);

    let now = chrono::Utc::now();
    bus.publish(Event {
        id: "ring-1".to_owned(),
        source_connector_id: "doorbell-1".to_owned(),
        event_type: EventType::Ring,
        device_id: Some("front-door".to_owned()),
        occurred_at: now,
        received_at: now,
        payload: Default::default(),
        capabilities_observed: Default::default(),
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(completed.lock().await.len(), 1);
    assert_eq!(dispatcher.completed_count(), 1);
    assert_eq!(dispatcher.failed_count(), 0);
}

#[tokio::test]
async fn duplicate_fingerprint_while_in_flight_is_coalesced() {
    use fabric::fingerprint::InFlightRegistry;

    let in_flight = InFlightRegistry::new();
    assert!(in_flight.try_begin("fp-1"));
    assert!(!in_flight.try_begin("fp-1"), "a second claim of the same fingerprint must fail while in flight");
    in_flight.finish("fp-1");
    assert!(in_flight.try_begin("fp-1"), "after finish, the fingerprint is claimable again");
}
