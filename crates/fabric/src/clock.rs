// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock/Scheduler (C1): monotonic time, timers, retry backoff.
//!
//! One abstraction all backoff, heartbeat, and retention-sweep logic is
//! registered against, so a single `Clock` can be cloned freely (it is a
//! thin handle around a wall-clock offset used only in tests).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A monotonic + wall-clock snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Now {
    pub monotonic: Instant,
    pub wall: DateTime<Utc>,
}

/// Clock handle. Cheap to clone; all clones share the same (test-only) wall
/// offset so virtual time can be advanced uniformly.
#[derive(Clone)]
pub struct Clock {
    wall_offset_ms: Arc<AtomicI64>,
}

impl Clock {
    pub fn new() -> Self {
        Self { wall_offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Current monotonic + wall time.
    pub fn now(&self) -> Now {
        let offset = self.wall_offset_ms.load(Ordering::Relaxed);
        let wall = Utc::now() + chrono::Duration::milliseconds(offset);
        Now { monotonic: Instant::now(), wall }
    }

    /// Advance the virtual wall clock by `delta`. Used only by tests that
    /// need to simulate clock skew without sleeping in real time.
    pub fn advance_wall(&self, delta: Duration) {
        self.wall_offset_ms.fetch_add(delta.as_millis() as i64, Ordering::Relaxed);
    }

    /// Run `task` once after `duration`, unless cancelled first.
    ///
    /// Returns a [`TimerHandle`] that cancels the timer; cancellation is
    /// observed before the timer would otherwise fire.
    pub fn after<F>(&self, duration: Duration, task: F) -> TimerHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(duration) => task.await,
            }
        });
        TimerHandle { cancel, handle: Some(handle) }
    }

    /// Run `task` every `interval` until cancelled.
    pub fn every<F, Fut>(&self, interval: Duration, mut task: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = timer.tick() => task().await,
                }
            }
        });
        TimerHandle { cancel, handle: Some(handle) }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable timer. Dropping without calling [`TimerHandle::cancel`]
/// leaves the timer running in the background (matches `tokio::spawn`
/// semantics); callers that need deterministic teardown should cancel
/// explicitly.
pub struct TimerHandle {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent. Does not wait for the task to observe
    /// cancellation — use [`TimerHandle::cancel_and_join`] for that.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the timer and wait for its task to finish.
    pub async fn cancel_and_join(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Exponential backoff with jitter, per spec §4.3:
/// `delay_n = min(cap, base * 2^n) * (0.5 + rand * 0.5)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts, attempt: 0 }
    }

    /// Reset the attempt counter (call on successful reconnect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt budget is exhausted (spec: capped at 10 attempts
    /// before transitioning to `failed(exhausted)`).
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let n = self.attempt;
        self.attempt += 1;
        Self::delay_for(self.base, self.cap, n)
    }

    /// Pure delay computation for attempt `n`, exposed for boundary tests.
    pub fn delay_for(base: Duration, cap: Duration, n: u32) -> Duration {
        let exp = 2u64.saturating_pow(n.min(20)).min(u32::MAX as u64) as u32;
        let unjittered = base.saturating_mul(exp).min(cap);
        let jitter = 0.5 + rand::random::<f64>() * 0.5;
        Duration::from_secs_f64(unjittered.as_secs_f64() * jitter)
    }
}

#[cfg(test)]
mod clock_tests;
