// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlation Core (C8): per-object trajectory tracking across detection
//! points, computing transit speed between line/zone crossing events on
//! the same track (spec §4.8).
//!
//! Runs entirely on the bus-delivery task for its one subscription — no
//! worker pool, `O(K)` work per event, single-writer over every `Track`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::bus::{DropPolicy, EventBus, Filter};
use crate::clock::Clock;
use crate::event::{Event, EventType};

const DEFAULT_K: usize = 10;
const DEFAULT_MIN_DT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DT: Duration = Duration::from_secs(300);
const DEFAULT_V_MIN: f64 = 5.0;
const DEFAULT_V_MAX: f64 = 200.0;
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
const DEFAULT_RETENTION_HOURS: i64 = 24;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Either a geographic (lat, lon) or planar (x, y in meters) position,
/// tagged so the distance function picks the right formula (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Geographic { lat: f64, lon: f64 },
    Planar { x: f64, y: f64 },
}

/// `(id, position, direction, speed_limit, active)` (spec §3).
#[derive(Debug, Clone)]
pub struct DetectionPoint {
    pub id: String,
    pub position: Position,
    pub direction: Option<f64>,
    pub speed_limit: Option<f64>,
    pub active: bool,
}

/// Track keys live in two distinct namespaces so a plate and a tracking id
/// that happen to share the same string can never collide (spec §9 Open
/// Question resolution).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackKey {
    Plate(String),
    Tracking(String),
}

impl TrackKey {
    /// `tracking_id` is preferred over `plate` when an event carries both
    /// (spec §4.8 "Per-track deque").
    fn from_event(payload: &serde_json::Map<String, Value>) -> Option<Self> {
        if let Some(id) = payload.get("tracking_id").and_then(Value::as_str) {
            return Some(TrackKey::Tracking(id.to_owned()));
        }
        if let Some(plate) = payload.get("plate").and_then(Value::as_str) {
            return Some(TrackKey::Plate(plate.to_owned()));
        }
        None
    }
}

/// One detection in a track's deque.
#[derive(Debug, Clone)]
pub struct Detection {
    pub detection_point_id: String,
    pub t: DateTime<Utc>,
    pub confidence: f64,
    pub payload: serde_json::Map<String, Value>,
}

/// Keyed by `(tracking_id OR plate)`; bounded deque of the most recent `K`
/// detections plus incremental running-average speed bookkeeping (spec
/// §4.8).
#[derive(Debug, Clone)]
pub struct Track {
    pub detections: VecDeque<Detection>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub speed_samples: u64,
    pub mean_speed_kmh: f64,
    pub alerts: u64,
}

impl Track {
    fn new(first: Detection) -> Self {
        let mut detections = VecDeque::with_capacity(DEFAULT_K);
        let t = first.t;
        detections.push_back(first);
        Self { detections, first_seen: t, last_seen: t, speed_samples: 0, mean_speed_kmh: 0.0, alerts: 0 }
    }

    fn push(&mut self, detection: Detection, capacity: usize) {
        if detection.t > self.last_seen {
            self.last_seen = detection.t;
        }
        if detection.t < self.first_seen {
            self.first_seen = detection.t;
        }
        self.detections.push_back(detection);
        while self.detections.len() > capacity {
            self.detections.pop_front();
        }
    }

    /// Incremental running average: `mu_n = mu_{n-1} + (v_n - mu_{n-1}) / n`.
    fn record_speed(&mut self, v: f64) {
        self.speed_samples += 1;
        self.mean_speed_kmh += (v - self.mean_speed_kmh) / self.speed_samples as f64;
    }
}

/// Tunables named in spec §4.8 / §6.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub k: usize,
    pub min_dt: Duration,
    pub max_dt: Duration,
    pub v_min: f64,
    pub v_max: f64,
    pub confidence_threshold: f64,
    pub retention: chrono::Duration,
    pub sweep_interval: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            min_dt: DEFAULT_MIN_DT,
            max_dt: DEFAULT_MAX_DT,
            v_min: DEFAULT_V_MIN,
            v_max: DEFAULT_V_MAX,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Great-circle distance (haversine, `R = 6371 km`) between two geographic
/// points, or planar Euclidean distance (meters, scaled by `1e-3` to
/// kilometers) between two planar points. Mismatched or missing positions
/// yield `d = 0`, which callers treat as "skip this sample" (spec §4.8
/// edge case).
fn distance_km(a: Position, b: Position) -> f64 {
    match (a, b) {
        (Position::Geographic { lat: lat1, lon: lon1 }, Position::Geographic { lat: lat2, lon: lon2 }) => {
            let (lat1, lon1, lat2, lon2) =
                (lat1.to_radians(), lon1.to_radians(), lat2.to_radians(), lon2.to_radians());
            let dlat = lat2 - lat1;
            let dlon = lon2 - lon1;
            let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
            2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
        }
        (Position::Planar { x: x1, y: y1 }, Position::Planar { x: x2, y: y2 }) => {
            (((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt()) * 1e-3
        }
        _ => 0.0,
    }
}

/// Holds every registered detection point and every live track, mutated
/// only by the bus-delivery task for its one subscription (spec §5:
/// "`Track` records are modified only on the C8 intake task").
pub struct CorrelationCore {
    points: Mutex<HashMap<String, DetectionPoint>>,
    tracks: Mutex<HashMap<TrackKey, Track>>,
    config: CorrelationConfig,
    bus: EventBus,
    speed_calculated: AtomicU64,
    speed_alerts: AtomicU64,
    ignored_low_confidence: AtomicU64,
    /// Holds the sweep timer alive for the process lifetime — dropping a
    /// [`crate::clock::TimerHandle`] cancels it.
    sweep_handle: Mutex<Option<crate::clock::TimerHandle>>,
}

impl CorrelationCore {
    pub fn new(bus: EventBus, config: CorrelationConfig) -> Arc<Self> {
        Arc::new(Self {
            points: Mutex::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
            config,
            bus,
            speed_calculated: AtomicU64::new(0),
            speed_alerts: AtomicU64::new(0),
            ignored_low_confidence: AtomicU64::new(0),
            sweep_handle: Mutex::new(None),
        })
    }

    /// `register_detection_point(id, position, direction, speed_limit)`
    /// (spec §4.8).
    pub fn register_detection_point(&self, point: DetectionPoint) {
        self.points.lock().insert(point.id.clone(), point);
    }

    pub fn detection_point(&self, id: &str) -> Option<DetectionPoint> {
        self.points.lock().get(id).cloned()
    }

    pub fn speed_calculated_count(&self) -> u64 {
        self.speed_calculated.load(Ordering::Relaxed)
    }

    pub fn speed_alert_count(&self) -> u64 {
        self.speed_alerts.load(Ordering::Relaxed)
    }

    /// Subscribe to `lineCrossing`/`zoneDetection` events carrying a
    /// `tracking_id` or `plate` (spec §4.8 "Event intake"), and spawn the
    /// periodic retention sweep.
    pub fn spawn(self: &Arc<Self>, clock: &Clock) -> crate::bus::SubscriptionHandle {
        let filter = Filter::new(move |event: &Event| {
            let has_tag =
                event.capabilities_observed.contains("lineCrossing") || event.capabilities_observed.contains("zoneDetection");
            has_tag && TrackKey::from_event(&event.payload).is_some()
        });

        let sink_core = Arc::clone(self);
        let sink: crate::bus::Sink = Arc::new(move |event| {
            let core = Arc::clone(&sink_core);
            Box::pin(async move {
                core.ingest(event);
            })
        });

        let handle = self.bus.subscribe(filter, sink, DropPolicy::DropOldest, None);

        let sweep_core = Arc::clone(self);
        let sweep_interval = self.config.sweep_interval;
        let sweep_timer = clock.every(sweep_interval, move || {
            let core = Arc::clone(&sweep_core);
            async move { core.sweep() }
        });
        *self.sweep_handle.lock() = Some(sweep_timer);

        handle
    }

    fn ingest(&self, event: Event) {
        let Some(confidence) = confidence_of(&event.payload) else {
            // Missing confidence is treated as present-but-unqualified; the
            // spec only gates on confidence when the field exists.
            self.ingest_detection(event, 1.0);
            return;
        };
        if confidence < self.config.confidence_threshold {
            self.ignored_low_confidence.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.ingest_detection(event, confidence);
    }

    fn ingest_detection(&self, event: Event, confidence: f64) {
        let Some(key) = TrackKey::from_event(&event.payload) else { return };
        let Some(point_id) = detection_point_id_of(&event.payload) else { return };

        let detection = Detection { detection_point_id: point_id.clone(), t: event.occurred_at, confidence, payload: event.payload.clone() };

        let mut tracks = self.tracks.lock();
        match tracks.entry(key.clone()) {
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(Track::new(detection.clone()));
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().push(detection.clone(), self.config.k);
            }
        }
        let earlier: Vec<Detection> = tracks
            .get(&key)
            .map(|track| track.detections.iter().filter(|d| d.detection_point_id != point_id).cloned().collect())
            .unwrap_or_default();
        drop(tracks);

        for earlier_detection in earlier {
            self.consider_pair(&key, &earlier_detection, &detection);
        }
    }

    /// Speed computation for one qualifying pair (spec §4.8 "Speed
    /// computation").
    fn consider_pair(&self, key: &TrackKey, earlier: &Detection, later: &Detection) {
        if earlier.detection_point_id == later.detection_point_id {
            return; // same-point consecutive detections are ignored
        }
        let dt = (later.t - earlier.t).num_milliseconds() as f64 / 1000.0;
        if dt < 0.0 {
            return; // negative dt (clock skew) is ignored
        }
        if dt < self.config.min_dt.as_secs_f64() || dt > self.config.max_dt.as_secs_f64() {
            return;
        }

        let (point_i, point_j) = {
            let points = self.points.lock();
            (points.get(&earlier.detection_point_id).cloned(), points.get(&later.detection_point_id).cloned())
        };
        let (Some(point_i), Some(point_j)) = (point_i, point_j) else { return };

        let d = distance_km(point_i.position, point_j.position);
        if d == 0.0 {
            return; // missing/zero distance: sample skipped
        }

        let v = d / (dt / 3600.0);
        if v < self.config.v_min || v > self.config.v_max {
            return;
        }

        self.speed_calculated.fetch_add(1, Ordering::Relaxed);
        {
            let mut tracks = self.tracks.lock();
            if let Some(track) = tracks.get_mut(key) {
                track.record_speed(v);
            }
        }

        let track_key_str = track_key_to_string(key);
        self.emit(
            EventType::SpeedCalculated,
            json!({
                "track_key": track_key_str,
                "v": v,
                "d": d,
                "dt": dt,
                "point_i": point_i.id,
                "point_j": point_j.id,
            }),
        );

        let limit = point_i.speed_limit.or(point_j.speed_limit);
        if let Some(limit) = limit {
            if v > limit {
                self.speed_alerts.fetch_add(1, Ordering::Relaxed);
                {
                    let mut tracks = self.tracks.lock();
                    if let Some(track) = tracks.get_mut(key) {
                        track.alerts += 1;
                    }
                }
                self.emit(
                    EventType::SpeedAlert,
                    json!({ "track_key": track_key_str, "v": v, "limit": limit, "excess": v - limit }),
                );
            }
        }
    }

    /// Periodic sweep evicting tracks whose `last_seen` is older than the
    /// retention window (spec §4.8 "Retention").
    fn sweep(&self) {
        let cutoff = Utc::now() - self.config.retention;
        self.tracks.lock().retain(|_, track| track.last_seen >= cutoff);
    }

    fn emit(&self, event_type: EventType, fields: Value) {
        let mut payload = serde_json::Map::new();
        if let Value::Object(map) = fields {
            payload = map;
        }
        let now = Utc::now();
        self.bus.publish(Event {
            id: uuid::Uuid::new_v4().to_string(),
            source_connector_id: "correlation-core".to_owned(),
            event_type,
            device_id: None,
            occurred_at: now,
            received_at: now,
            payload,
            capabilities_observed: Default::default(),
        });
    }
}

fn confidence_of(payload: &serde_json::Map<String, Value>) -> Option<f64> {
    payload.get("confidence").and_then(Value::as_f64)
}

/// Precedence for the detection-point identifier a crossing/zone event
/// carries, declared explicitly rather than guessed (mirrors the
/// `device_id` precedence decision in `event.rs`).
fn detection_point_id_of(payload: &serde_json::Map<String, Value>) -> Option<String> {
    for key in ["detection_point_id", "zoneId", "lineId"] {
        if let Some(v) = payload.get(key).and_then(Value::as_str) {
            return Some(v.to_owned());
        }
    }
    None
}

fn track_key_to_string(key: &TrackKey) -> String {
    match key {
        TrackKey::Plate(p) => format!("plate:{p}"),
        TrackKey::Tracking(t) => format!("track:{t}"),
    }
}

#[cfg(test)]
mod correlation_tests;
