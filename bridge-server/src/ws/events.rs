use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::models::action::ActionKind;
use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_BACKUP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "cycle:started")]
    CycleStarted { cycle_id: i64, trigger: String },

    #[serde(rename = "action:started")]
    ActionStarted {
        backup_id: String,
        kind: ActionKind,
        attempt: u32,
    },

    #[serde(rename = "action:retry")]
    ActionRetry {
        backup_id: String,
        kind: ActionKind,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    #[serde(rename = "action:completed")]
    ActionCompleted {
        backup_id: String,
        kind: ActionKind,
        attempt: u32,
    },

    #[serde(rename = "action:failed")]
    ActionFailed {
        backup_id: String,
        kind: ActionKind,
        attempt: u32,
        error: String,
    },

    #[serde(rename = "action:deferred")]
    ActionDeferred { backup_id: String, kind: ActionKind },

    #[serde(rename = "cycle:finished")]
    CycleFinished {
        cycle_id: i64,
        status: String,
        succeeded: usize,
        failed: usize,
        deferred: usize,
        dropped: usize,
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn backup_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ActionStarted { backup_id, .. }
            | EngineEvent::ActionRetry { backup_id, .. }
            | EngineEvent::ActionCompleted { backup_id, .. }
            | EngineEvent::ActionFailed { backup_id, .. }
            | EngineEvent::ActionDeferred { backup_id, .. } => Some(backup_id),
            EngineEvent::CycleStarted { .. } | EngineEvent::CycleFinished { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub event: EngineEvent,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<String, VecDeque<QueuedEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let msg = match serde_json::to_string(&event) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Failed to serialize event: {e}");
                return;
            }
        };

        // Keep per-backup history for clients that connect late
        if let Some(id) = event.backup_id() {
            let mut entry = self.queue.entry(id.to_string()).or_default();
            entry.push_back(QueuedEvent {
                event: event.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            if entry.len() > MAX_QUEUE_PER_BACKUP {
                entry.pop_front();
            }
        }

        // No receivers is fine
        let _ = self.tx.send(msg);
    }

    /// Drops the history of every backup `keep` rejects.
    pub fn retain_backups(&self, keep: impl Fn(&str) -> bool) {
        self.queue.retain(|id, _| keep(id));
    }

    pub fn history(&self, backup_id: &str, since: i64) -> Vec<QueuedEvent> {
        self.queue
            .get(backup_id)
            .map(|q| q.iter().filter(|m| m.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.events.clone()))
}

async fn handle_socket(socket: WebSocket, events: EventBus) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = events.subscribe();
    // Replays go to this client only.
    let (replay_tx, mut replay_rx) = mpsc::channel::<String>(MAX_QUEUE_PER_BACKUP);

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                m = rx.recv() => match m {
                    Ok(m) => m,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("WebSocket client lagged by {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(m) = replay_rx.recv() => m,
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Clients may ask for history: {"type":"replay:request","payload":{"backupId":"...","since":0}}
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(parsed) = serde_json::from_str::<Value>(&text) else { continue };
            if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
                continue;
            }
            let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
            let backup_id = payload.get("backupId").and_then(|v| v.as_str()).unwrap_or("");
            let since = payload.get("since").and_then(|v| v.as_i64()).unwrap_or(0);
            for queued in events.history(backup_id, since) {
                if let Ok(m) = serde_json::to_string(&queued.event) {
                    if replay_tx.send(m).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
