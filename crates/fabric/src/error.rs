// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Closed error taxonomy for the event fabric.
//!
//! Every surfaced error is a tagged value, never a bare string — the string
//! form (via `Display`) is for logs only. See spec §7 for the recovery
//! policy attached to each variant.

use std::time::Duration;

/// Errors a connector can return from `connect()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("auth error: {0}")]
    Auth(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors a connector can return from `execute()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    #[error("connector not connected")]
    NotConnected,
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    #[error("unknown operation: {capability}.{operation}")]
    UnknownOperation { capability: String, operation: String },
    #[error("parameter error: {0}")]
    Param(#[from] ParamError),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Parameter validation failure from the capability registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParamError {
    #[error("missing required parameter {0:?}")]
    Missing(String),
    #[error("parameter {name:?} expected {expected}, got {got}")]
    WrongType { name: String, expected: &'static str, got: String },
    #[error("parameter {name:?} must be one of {allowed:?}, got {got:?}")]
    NotAllowed { name: String, allowed: Vec<&'static str>, got: String },
}

/// Frame decode failures from the binary frame codec (spec §4.4).
///
/// Always absorbed at the layer that creates it: the caller logs and skips
/// the single frame, the session is never terminated because of one.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than header (8 bytes): got {0}")]
    Truncated(usize),
    #[error("declared payload size {declared} exceeds remaining bytes {remaining}")]
    PayloadOverrun { declared: usize, remaining: usize },
    #[error("action frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown payload format byte {0}")]
    UnknownPayloadFormat(u8),
    #[error("deflate decompression failed: {0}")]
    Inflate(String),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors surfaced by the rule engine / action dispatcher pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("no connector registered with id {0:?}")]
    UnknownConnector(String),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("dispatcher queue is full, invocation rejected")]
    QueueFull,
    #[error("cancelled")]
    Cancelled,
}
