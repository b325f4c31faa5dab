use chrono::{DateTime, Utc};
use pulse_core::wire::{encode_frame, DEFAULT_MAX_FRAME_BYTES};
use pulse_core::WireEvent;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Consecutive unanswered probes after which a connection is dropped.
pub const MAX_MISSED_PROBES: u32 = 2;

pub type ConnectionId = String;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel queue full")]
    Full,
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// One delivery endpoint. Implementations must not block: the broadcaster
/// calls these from the poll loop for every connection in turn.
pub trait Channel: Send + Sync {
    fn send(&self, text: &str) -> Result<(), ChannelError>;
    fn ping(&self) -> Result<(), ChannelError>;
    fn close(&self, reason: &str);
    fn is_open(&self) -> bool;
}

struct Connection {
    channel: Arc<dyn Channel>,
    acknowledged: bool,
    missed_probes: u32,
    connected_at: DateTime<Utc>,
}

pub struct Broadcaster {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
    sync_gate: Mutex<()>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            sync_gate: Mutex::new(()),
        }
    }

    /// Held by the poll loop from publishing a snapshot until its changes are
    /// broadcast, and by a joining connection from reading that snapshot
    /// until it is registered. A joiner therefore sees every snapshot either
    /// in its sync or through the broadcast deltas.
    pub async fn sync_guard(&self) -> MutexGuard<'_, ()> {
        self.sync_gate.lock().await
    }

    fn next_connection_id(&self) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("conn-{id}")
    }

    pub async fn register(&self, channel: Arc<dyn Channel>) -> ConnectionId {
        self.register_with(channel, Vec::new()).await
    }

    /// Registers a channel after delivering the `connected` heartbeat and
    /// `initial` events to it. Nothing broadcast before the insert can reach
    /// the channel, so the initial events always come first. A channel that
    /// fails during this handshake is closed and never registered.
    pub async fn register_with(
        &self,
        channel: Arc<dyn Channel>,
        initial: Vec<WireEvent>,
    ) -> ConnectionId {
        let conn_id = self.next_connection_id();
        let clients = self.connection_count().await + 1;
        let connected = WireEvent::heartbeat(
            Utc::now(),
            json!({
                "kind": "connected",
                "connectionId": conn_id,
                "clients": clients,
            }),
        );

        for event in std::iter::once(connected).chain(initial) {
            if let Err(err) = self.deliver(channel.as_ref(), &event) {
                warn!(event = "register_send_failed", conn_id = %conn_id, error = %err);
                channel.close("send_failed");
                return conn_id;
            }
        }

        let clients = {
            let mut connections = self.connections.write().await;
            connections.insert(
                conn_id.clone(),
                Connection {
                    channel,
                    acknowledged: true,
                    missed_probes: 0,
                    connected_at: Utc::now(),
                },
            );
            connections.len()
        };
        info!(event = "client_registered", conn_id = %conn_id, clients);
        conn_id
    }

    pub async fn unregister(&self, conn_id: &str) -> bool {
        let removed = self.connections.write().await.remove(conn_id);
        match removed {
            Some(connection) => {
                let connected_secs = Utc::now()
                    .signed_duration_since(connection.connected_at)
                    .num_seconds();
                info!(event = "client_unregistered", conn_id = %conn_id, connected_secs);
                true
            }
            None => false,
        }
    }

    /// Sends to every open channel; returns how many accepted the frame.
    /// Channels that fail are evicted.
    pub async fn broadcast(&self, event: &WireEvent) -> usize {
        let text = match encode_frame(event, self.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "broadcast_encode_failed", event_type = %event.event_type, error = %err);
                return 0;
            }
        };

        let targets = self.open_channels().await;
        let mut reached = 0;
        let mut failed = Vec::new();
        for (conn_id, channel) in targets {
            match channel.send(&text) {
                Ok(()) => reached += 1,
                Err(err) => {
                    warn!(event = "send_failed", conn_id = %conn_id, error = %err);
                    failed.push(conn_id);
                }
            }
        }
        for conn_id in failed {
            self.evict(&conn_id, "send_failed").await;
        }
        reached
    }

    pub async fn send_to(&self, conn_id: &str, events: &[WireEvent]) -> bool {
        let channel = {
            let connections = self.connections.read().await;
            match connections.get(conn_id) {
                Some(connection) => connection.channel.clone(),
                None => return false,
            }
        };
        for event in events {
            if let Err(err) = self.deliver(channel.as_ref(), event) {
                warn!(event = "send_failed", conn_id = %conn_id, error = %err);
                self.evict(conn_id, "send_failed").await;
                return false;
            }
        }
        true
    }

    pub async fn acknowledge(&self, conn_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(conn_id) {
            connection.acknowledged = true;
            connection.missed_probes = 0;
        }
    }

    /// One liveness round: count misses for channels that never answered the
    /// previous ping, evict at two strikes, ping the rest and broadcast the
    /// client count. Returns the number of connections left.
    pub async fn probe_liveness(&self) -> usize {
        let mut expired = Vec::new();
        let mut to_ping = Vec::new();
        {
            let mut connections = self.connections.write().await;
            for (conn_id, connection) in connections.iter_mut() {
                if connection.acknowledged {
                    connection.missed_probes = 0;
                } else {
                    connection.missed_probes += 1;
                }
                if connection.missed_probes >= MAX_MISSED_PROBES || !connection.channel.is_open() {
                    expired.push(conn_id.clone());
                    continue;
                }
                connection.acknowledged = false;
                to_ping.push((conn_id.clone(), connection.channel.clone()));
            }
        }

        for conn_id in expired {
            self.evict(&conn_id, "liveness_timeout").await;
        }

        let mut failed = Vec::new();
        for (conn_id, channel) in to_ping {
            if let Err(err) = channel.ping() {
                debug!(event = "ping_failed", conn_id = %conn_id, error = %err);
                failed.push(conn_id);
            }
        }
        for conn_id in failed {
            self.evict(&conn_id, "ping_failed").await;
        }

        let clients = self.connection_count().await;
        let heartbeat = WireEvent::heartbeat(
            Utc::now(),
            json!({
                "kind": "heartbeat",
                "clients": clients,
            }),
        );
        self.broadcast(&heartbeat).await;
        clients
    }

    pub async fn close_all(&self, reason: &str) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        let count = drained.len();
        for (_, connection) in drained {
            connection.channel.close(reason);
        }
        info!(event = "clients_closed", count, reason);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, conn_id: &str) -> bool {
        self.connections.read().await.contains_key(conn_id)
    }

    async fn open_channels(&self) -> Vec<(ConnectionId, Arc<dyn Channel>)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, connection)| connection.channel.is_open())
            .map(|(conn_id, connection)| (conn_id.clone(), connection.channel.clone()))
            .collect()
    }

    async fn evict(&self, conn_id: &str, reason: &str) {
        let removed = self.connections.write().await.remove(conn_id);
        if let Some(connection) = removed {
            connection.channel.close(reason);
            info!(event = "client_evicted", conn_id = %conn_id, reason);
        }
    }

    fn deliver(&self, channel: &dyn Channel, event: &WireEvent) -> Result<(), ChannelError> {
        let text = encode_frame(event, self.max_frame_bytes)
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        channel.send(&text)
    }
}
