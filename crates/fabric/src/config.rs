// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide tunable surface (spec §6), one `clap::Args` struct covering
//! every CLI/environment toggle the fabric's modules read at construction.

use std::time::Duration;

/// Configuration for the event fabric process.
#[derive(Debug, Clone, clap::Args)]
pub struct FabricConfig {
    /// Per-source event bus ring buffer size (`Q_src`).
    #[arg(long, default_value_t = 1024, env = "FABRIC_EVENT_QUEUE_SIZE")]
    pub event_queue_size: usize,

    /// Per-subscriber event bus delivery queue size (`Q_sub`).
    #[arg(long, default_value_t = 256, env = "FABRIC_SUB_QUEUE_SIZE")]
    pub sub_queue_size: usize,

    /// Max duration a `slow_down_source` subscription blocks new publishes
    /// before falling back to drop-oldest (`T_bp`).
    #[arg(long, default_value_t = 100, env = "FABRIC_BACKPRESSURE_MS")]
    pub backpressure_ms: u64,

    /// Maximum number of rules the engine accepts.
    #[arg(long, default_value_t = 100, env = "FABRIC_RULE_MAX")]
    pub rule_max: usize,

    /// Action dispatcher worker pool size.
    #[arg(long, default_value_t = 16, env = "FABRIC_ACTION_WORKERS")]
    pub action_workers: usize,

    /// Action dispatcher bounded queue capacity.
    #[arg(long, default_value_t = 256, env = "FABRIC_ACTION_QUEUE_SIZE")]
    pub action_queue_size: usize,

    /// Default per-invocation action deadline, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "FABRIC_ACTION_TIMEOUT_MS")]
    pub action_timeout_ms: u64,

    /// Max action execution attempts before giving up (retry policy).
    #[arg(long, default_value_t = 3, env = "FABRIC_ACTION_RETRY_MAX_ATTEMPTS")]
    pub action_retry_max_attempts: u32,

    /// Connector connect() timeout (`T_connect`), in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "FABRIC_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// Reconnect backoff base delay, in milliseconds.
    #[arg(long, default_value_t = 1_000, env = "FABRIC_BACKOFF_BASE_MS")]
    pub backoff_base_ms: u64,

    /// Reconnect backoff cap, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "FABRIC_BACKOFF_CAP_MS")]
    pub backoff_cap_ms: u64,

    /// Max reconnect attempts before `failed(exhausted)`.
    #[arg(long, default_value_t = 10, env = "FABRIC_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: u32,

    /// Heartbeat probe interval, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "FABRIC_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat ack timeout, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "FABRIC_HEARTBEAT_TIMEOUT_MS")]
    pub heartbeat_timeout_ms: u64,

    /// Per-device dedup window size (`N`), last-seen event ids retained.
    #[arg(long, default_value_t = 1024, env = "FABRIC_DEDUP_WINDOW")]
    pub dedup_window: usize,

    /// Token-bucket rate limit window (`W`), in seconds.
    #[arg(long, default_value_t = 60, env = "FABRIC_RATE_LIMIT_WINDOW_SECS")]
    pub rate_limit_window_secs: u64,

    /// Token-bucket rate limit budget (`B`) per window.
    #[arg(long, default_value_t = 100, env = "FABRIC_RATE_LIMIT_BUDGET")]
    pub rate_limit_budget: u32,

    /// Cooldown after a `429`/rate-limit response, in seconds.
    #[arg(long, default_value_t = 5, env = "FABRIC_RATE_LIMIT_COOLDOWN_SECS")]
    pub rate_limit_cooldown_secs: u64,

    /// Device snapshot cache TTL, in seconds.
    #[arg(long, default_value_t = 300, env = "FABRIC_DEVICE_CACHE_TTL_SECS")]
    pub device_cache_ttl_secs: u64,

    /// Correlation core per-track deque capacity (`K`).
    #[arg(long, default_value_t = 10, env = "FABRIC_TRACK_DEQUE_SIZE")]
    pub track_deque_size: usize,

    /// Minimum seconds between two detections for a speed sample to count.
    #[arg(long, default_value_t = 1, env = "FABRIC_SPEED_MIN_DT_SECS")]
    pub speed_min_dt_secs: u64,

    /// Maximum seconds between two detections for a speed sample to count.
    #[arg(long, default_value_t = 300, env = "FABRIC_SPEED_MAX_DT_SECS")]
    pub speed_max_dt_secs: u64,

    /// Minimum plausible speed, km/h, below which a sample is discarded.
    #[arg(long, default_value_t = 5.0, env = "FABRIC_SPEED_MIN_KMH")]
    pub speed_min_kmh: f64,

    /// Maximum plausible speed, km/h, above which a sample is discarded.
    #[arg(long, default_value_t = 200.0, env = "FABRIC_SPEED_MAX_KMH")]
    pub speed_max_kmh: f64,

    /// Confidence threshold (`θ_conf`) below which a detection is ignored.
    #[arg(long, default_value_t = 0.7, env = "FABRIC_SPEED_CONFIDENCE_THRESHOLD")]
    pub speed_confidence_threshold: f64,

    /// Track retention horizon (`H`), in hours.
    #[arg(long, default_value_t = 24, env = "FABRIC_TRACK_RETENTION_HOURS")]
    pub track_retention_hours: i64,

    /// Track retention sweep interval, in seconds.
    #[arg(long, default_value_t = 60, env = "FABRIC_TRACK_SWEEP_INTERVAL_SECS")]
    pub track_sweep_interval_secs: u64,
}

impl FabricConfig {
    pub fn backpressure(&self) -> Duration {
        Duration::from_millis(self.backpressure_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn device_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.device_cache_ttl_secs)
    }

    pub fn speed_min_dt(&self) -> Duration {
        Duration::from_secs(self.speed_min_dt_secs)
    }

    pub fn speed_max_dt(&self) -> Duration {
        Duration::from_secs(self.speed_max_dt_secs)
    }

    pub fn track_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.track_retention_hours)
    }

    pub fn track_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.track_sweep_interval_secs)
    }

    pub fn connector_config(&self) -> crate::connector::ConnectorConfig {
        crate::connector::ConnectorConfig {
            t_connect: self.connect_timeout(),
            backoff_base: self.backoff_base(),
            backoff_cap: self.backoff_cap(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            rate_limit_window: self.rate_limit_window(),
            rate_limit_budget: self.rate_limit_budget,
            rate_limit_cooldown: self.rate_limit_cooldown(),
            heartbeat_interval: self.heartbeat_interval(),
            heartbeat_timeout: self.heartbeat_timeout(),
            dedup_window: self.dedup_window,
            poll_interval: Duration::from_secs(10),
            device_cache_ttl: self.device_cache_ttl(),
        }
    }

    pub fn dispatcher_config(&self) -> crate::dispatcher::ActionDispatcherConfig {
        crate::dispatcher::ActionDispatcherConfig {
            workers: self.action_workers,
            queue_capacity: self.action_queue_size,
            default_deadline: self.action_timeout(),
            retry_max_attempts: self.action_retry_max_attempts,
            retry_base: self.backoff_base(),
            retry_cap: self.backoff_cap(),
        }
    }

    pub fn correlation_config(&self) -> crate::correlation::CorrelationConfig {
        crate::correlation::CorrelationConfig {
            k: self.track_deque_size,
            min_dt: self.speed_min_dt(),
            max_dt: self.speed_max_dt(),
            v_min: self.speed_min_kmh,
            v_max: self.speed_max_kmh,
            confidence_threshold: self.speed_confidence_threshold,
            retention: self.track_retention(),
            sweep_interval: self.track_sweep_interval(),
        }
    }
}

#[cfg(test)]
mod config_tests;
