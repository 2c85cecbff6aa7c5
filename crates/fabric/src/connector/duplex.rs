// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Duplex-socket transport (spec §6.2): a binary framed protocol upgraded
//! from a plaintext socket via a standard WebSocket handshake, with the API
//! key sent as an additional header. Subscribe messages follow the upgrade
//! and a 1 s settle delay.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::{self, DataPayload, DecodedMessage};
use crate::error::{ConnectError, ExecuteError};

use super::Transport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Topics subscribed to immediately after the settle delay (spec §6.2: "at
/// minimum `motion`, `smartDetectZone`, `camera`, `system`").
const DEFAULT_TOPICS: &[&str] = &["motion", "smartDetectZone", "camera", "system"];

const SETTLE_DELAY: Duration = Duration::from_secs(1);

pub struct DuplexTransport {
    url: String,
    api_key: String,
    topics: Vec<String>,
    socket: Mutex<Option<WsStream>>,
    reconnect_sequence: SyncMutex<u64>,
}

impl DuplexTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            topics: DEFAULT_TOPICS.iter().map(|s| s.to_string()).collect(),
            socket: Mutex::new(None),
            reconnect_sequence: SyncMutex::new(0),
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Config(e.to_string()))?;
        request
            .headers_mut()
            .insert("X-API-Key", self.api_key.parse().map_err(|_| ConnectError::Config("invalid api key".to_owned()))?);
        Ok(request)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&self) -> Result<(), ConnectError> {
        let request = self.build_request()?;
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let mut guard = self.socket.lock().await;
        *guard = Some(ws);
        drop(guard);

        tokio::time::sleep(SETTLE_DELAY).await;

        let mut guard = self.socket.lock().await;
        if let Some(ws) = guard.as_mut() {
            for topic in &self.topics {
                let subscribe = json!({ "action": "subscribe", "newUpdateId": topic });
                let text = serde_json::to_string(&subscribe).unwrap_or_default();
                ws.send(Message::Text(text.into())).await.map_err(|e| ConnectError::Unreachable(e.to_string()))?;
            }
        }
        *self.reconnect_sequence.lock() += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.socket.lock().await;
        if let Some(mut ws) = guard.take() {
            let _ = ws.close(None).await;
        }
    }

    async fn execute_raw(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Value, ExecuteError> {
        let mut guard = self.socket.lock().await;
        let Some(ws) = guard.as_mut() else {
            return Err(ExecuteError::NotConnected);
        };
        let action = json!({
            "action": "command",
            "capability": capability_id,
            "operation": operation,
            "params": parameters,
        });
        let text = serde_json::to_string(&action).unwrap_or_default();
        ws.send(Message::Text(text.into())).await.map_err(|e| ExecuteError::Upstream(e.to_string()))?;
        // The protocol is fire-and-forget for duplex command frames; the
        // acknowledgement (if any) arrives as an ordinary inbound message
        // and is not correlated here. Capability dispatch over this
        // transport is best-effort by design (spec §6: "the core knows only
        // operation signatures, not the wire format").
        Ok(Value::Null)
    }

    async fn recv(&self) -> Option<Value> {
        loop {
            // Held across the `next().await` suspension below, which the
            // duplex transport otherwise avoids. Safe only because `recv`
            // is driven exclusively by the connector's one reader task; a
            // second caller blocked on this same lock (e.g. a concurrent
            // `execute_raw` send) would wait out the next inbound message.
            let mut guard = self.socket.lock().await;
            let Some(ws) = guard.as_mut() else {
                return None;
            };
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    drop(guard);
                    match codec::decode(&bytes) {
                        Ok(decoded) => return Some(merge_decoded(decoded)),
                        Err(e) => {
                            tracing::debug!(err = %e, "duplex frame decode failed, skipping");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    drop(guard);
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            tracing::debug!(err = %e, "duplex text message was not JSON, skipping");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    drop(guard);
                    return Some(json!({ "action": "pong" }));
                }
                Some(Ok(Message::Close(_))) | None => {
                    drop(guard);
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(err = %e, "duplex socket error, session ending");
                    drop(guard);
                    return None;
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> bool {
        let mut guard = self.socket.lock().await;
        let Some(ws) = guard.as_mut() else {
            return false;
        };
        ws.send(Message::Ping(Vec::new().into())).await.is_ok()
    }
}

/// Merge a decoded action+data pair into one JSON envelope so the generic
/// pipeline's classifier and field-discovery logic can treat it uniformly
/// with plain-JSON and polling-sourced messages.
fn merge_decoded(decoded: DecodedMessage) -> Value {
    let mut action = decoded.action;
    if let Some(data) = decoded.data {
        let data_value = match data {
            DataPayload::Json(v) => v,
            DataPayload::Text(s) => Value::String(s),
            DataPayload::Bytes(b) => Value::String(format!("<{} bytes>", b.len())),
        };
        if let Value::Object(ref mut map) = action {
            map.insert("data".to_owned(), data_value);
        }
    }
    action
}
