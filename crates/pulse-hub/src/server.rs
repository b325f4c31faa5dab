use crate::broadcaster::{Broadcaster, Channel, ChannelError};
use crate::config::Config;
use crate::poll_loop::SnapshotReceiver;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pulse_core::sync_events;
use pulse_core::wire::format_timestamp;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

const CLOSE_NORMAL: u16 = 1000;

pub struct HubState {
    pub broadcaster: Arc<Broadcaster>,
    pub snapshots: SnapshotReceiver,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub debug: bool,
}

impl HubState {
    pub fn new(config: &Config, broadcaster: Arc<Broadcaster>, snapshots: SnapshotReceiver) -> Self {
        Self {
            broadcaster,
            snapshots,
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            debug: config.debug,
        }
    }
}

pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/state", get(state_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn state_handler(State(state): State<Arc<HubState>>) -> Json<Value> {
    let snapshot = state.snapshots.borrow().clone();
    let clients = state.broadcaster.connection_count().await;
    Json(json!({
        "timestamp": format_timestamp(snapshot.timestamp),
        "agents": snapshot.agents,
        "totalAgents": snapshot.agents.len(),
        "totalSessions": snapshot.total_sessions(),
        "totalTokens": snapshot.total_tokens(),
        "clients": clients,
    }))
}

/// A WebSocket connection seen through the broadcaster's `Channel` seam.
/// Frames go into a bounded queue drained by the connection's writer task;
/// a full queue is reported as a failure so the slow reader gets evicted.
pub struct WsChannel {
    sender: mpsc::Sender<Message>,
    open: AtomicBool,
}

impl WsChannel {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            open: AtomicBool::new(true),
        }
    }

    fn push(&self, message: Message) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Full),
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}

impl Channel for WsChannel {
    fn send(&self, text: &str) -> Result<(), ChannelError> {
        self.push(Message::Text(text.to_string()))
    }

    fn ping(&self) -> Result<(), ChannelError> {
        self.push(Message::Ping(Vec::new()))
    }

    fn close(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: reason.to_string().into(),
            })));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.sender.is_closed()
    }
}

async fn handle_socket(state: Arc<HubState>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.queue_capacity);
    let write_timeout = state.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            match tokio::time::timeout(write_timeout, ws_sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => break,
            }
            if closing {
                break;
            }
        }
    });

    let channel = Arc::new(WsChannel::new(tx));
    let (conn_id, synced) = {
        let _gate = state.broadcaster.sync_guard().await;
        let snapshot = state.snapshots.borrow().clone();
        let initial = sync_events(&snapshot, Utc::now());
        let synced = initial.len();
        let conn_id = state
            .broadcaster
            .register_with(channel.clone(), initial)
            .await;
        (conn_id, synced)
    };
    debug!(event = "client_synced", conn_id = %conn_id, agents = synced);

    loop {
        tokio::select! {
            _ = channel.closed() => {
                debug!(event = "writer_stopped", conn_id = %conn_id);
                break;
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => state.broadcaster.acknowledge(&conn_id).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "client_close", conn_id = %conn_id);
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if state.debug {
                            debug!(event = "client_message_ignored", conn_id = %conn_id, raw = %text);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %conn_id, error = %err);
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unregister(&conn_id).await;
    drop(channel);
    let _ = write_task.await;
}
