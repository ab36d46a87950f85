//! Dashboard broadcaster (C8): fan-out of call events to subscriber
//! WebSocket sessions.
//!
//! Grounded on `orchestrator/bus.rs`'s `AgentBus` (per-subscriber dedicated
//! `mpsc::Sender` held behind a mutex-guarded map, broadcast iterating a
//! snapshot and pruning dead senders) adapted from agent-to-agent routing to
//! dashboard fan-out, and on the original's `routers/dashboard.py`
//! `DashboardBroadcaster` for the semantic-helper surface and
//! replay-on-connect behavior.

use crate::analytics::Event;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveCallInfo {
    pub call_sid: String,
    pub caller: String,
    pub started_at: chrono::DateTime<Utc>,
}

struct Subscriber {
    sender: mpsc::UnboundedSender<String>,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    active_calls: Mutex<HashMap<String, ActiveCallInfo>>,
    next_subscriber_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            subscribers: Mutex::new(HashMap::new()),
            active_calls: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber session and returns its id plus a receiver
    /// of outbound JSON-text frames. Immediately enqueues an `init` frame.
    pub async fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().await.insert(id, Subscriber { sender: tx });

        let active: Vec<ActiveCallInfo> = self.active_calls.lock().await.values().cloned().collect();
        self.send_to(id, &json!({"type": "init", "active_calls": active})).await;

        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    async fn send_to(&self, id: u64, value: &serde_json::Value) {
        let subscribers = self.subscribers.lock().await;
        if let Some(sub) = subscribers.get(&id) {
            let _ = sub.sender.send(value.to_string());
        }
    }

    /// Serializes once and sends to every subscriber; dead senders are
    /// pruned on the next broadcast.
    pub async fn broadcast(&self, value: serde_json::Value) {
        let text = value.to_string();
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter() {
            if sub.sender.send(text.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            subscribers.remove(&id);
            debug!(subscriber_id = id, "pruned disconnected dashboard subscriber");
        }
    }

    pub async fn call_started(&self, call_sid: &str, caller: &str, called: &str) {
        self.active_calls.lock().await.insert(
            call_sid.to_string(),
            ActiveCallInfo {
                call_sid: call_sid.to_string(),
                caller: caller.to_string(),
                started_at: Utc::now(),
            },
        );
        self.broadcast(json!({
            "type": "call_started",
            "call_sid": call_sid,
            "caller": caller,
            "called": called,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn transcript(
        &self,
        call_sid: &str,
        speaker: &str,
        text: &str,
        turn_index: u32,
        latency_ms: Option<u64>,
    ) {
        self.broadcast(json!({
            "type": "transcript",
            "call_sid": call_sid,
            "speaker": speaker,
            "text": text,
            "turn_index": turn_index,
            "latency_ms": latency_ms,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn processing(&self, call_sid: &str, status: &str) {
        self.broadcast(json!({
            "type": "processing",
            "call_sid": call_sid,
            "status": status,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn call_ended(&self, call_sid: &str, duration_seconds: Option<f64>) {
        self.active_calls.lock().await.remove(call_sid);
        self.broadcast(json!({
            "type": "call_ended",
            "call_sid": call_sid,
            "duration_seconds": duration_seconds,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn error(&self, call_sid: &str, error_type: &str, message: &str) {
        self.broadcast(json!({
            "type": "error",
            "call_sid": call_sid,
            "error_type": error_type,
            "message": message,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn analytics_event(&self, call_sid: &str, event: &Event) {
        self.broadcast(json!({
            "type": "analytics_event",
            "call_sid": call_sid,
            "event": event,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn location_send_pending(
        &self,
        call_sid: &str,
        caller: &str,
        confidence: f64,
        reason: &str,
        timeout_seconds: u64,
    ) {
        self.broadcast(json!({
            "type": "location_send_pending",
            "call_sid": call_sid,
            "caller": caller,
            "confidence": confidence,
            "reason": reason,
            "timeout_seconds": timeout_seconds,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn location_sent(&self, call_sid: &str, caller: &str, trigger: &str, success: bool) {
        self.broadcast(json!({
            "type": "location_sent",
            "call_sid": call_sid,
            "caller": caller,
            "trigger": trigger,
            "success": success,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn location_cancelled(&self, call_sid: &str) {
        self.broadcast(json!({
            "type": "location_cancelled",
            "call_sid": call_sid,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn heartbeat(&self) {
        let count = self.active_calls.lock().await.len();
        self.broadcast(json!({
            "type": "heartbeat",
            "active_call_count": count,
            "ts": Utc::now(),
        }))
        .await;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pong_frame() -> serde_json::Value {
    json!({"type": "pong", "ts": Utc::now()})
}
