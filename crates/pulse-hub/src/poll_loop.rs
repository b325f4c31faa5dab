use crate::broadcaster::Broadcaster;
use chrono::Utc;
use pulse_core::{carry_known_models, detect, encode_all, Snapshot, SnapshotSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type SnapshotSender = watch::Sender<Arc<Snapshot>>;
pub type SnapshotReceiver = watch::Receiver<Arc<Snapshot>>;

pub fn snapshot_channel() -> (SnapshotSender, SnapshotReceiver) {
    watch::channel(Arc::new(Snapshot::empty(Utc::now())))
}

pub struct PollLoop {
    source: Arc<dyn SnapshotSource>,
    broadcaster: Arc<Broadcaster>,
    snapshots: SnapshotSender,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    previous: Option<Arc<Snapshot>>,
}

impl PollLoop {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        broadcaster: Arc<Broadcaster>,
        snapshots: SnapshotSender,
        poll_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            source,
            broadcaster,
            snapshots,
            poll_interval,
            heartbeat_interval,
            previous: None,
        }
    }

    /// Runs until `shutdown` flips to true (or its sender goes away), then
    /// closes every connection.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            event = "poll_loop_start",
            poll_ms = self.poll_interval.as_millis() as u64,
            heartbeat_secs = self.heartbeat_interval.as_secs()
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    self.tick().await;
                }
                _ = heartbeat.tick() => {
                    let clients = self.broadcaster.probe_liveness().await;
                    debug!(event = "heartbeat", clients);
                }
            }
        }

        self.broadcaster.close_all("server shutting down").await;
        info!(event = "poll_loop_stop");
    }

    /// One read-diff-broadcast cycle. Returns the number of events sent out.
    /// A failed read leaves the previous snapshot in place.
    pub async fn tick(&mut self) -> usize {
        let source = self.source.clone();
        let mut snapshot = match tokio::task::spawn_blocking(move || source.take_snapshot()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => {
                warn!(event = "snapshot_failed", error = %err);
                return 0;
            }
            Err(err) => {
                error!(event = "snapshot_task_failed", error = %err);
                return 0;
            }
        };

        carry_known_models(self.previous.as_deref(), &mut snapshot);
        let changes = detect(self.previous.as_deref(), &snapshot);
        let events = encode_all(changes, Utc::now());
        let snapshot = Arc::new(snapshot);
        self.previous = Some(snapshot.clone());

        let _gate = self.broadcaster.sync_guard().await;
        self.snapshots.send_replace(snapshot);
        for event in &events {
            self.broadcaster.broadcast(event).await;
        }
        if !events.is_empty() {
            debug!(event = "changes_broadcast", count = events.len());
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::testing::RecordingChannel;
    use pulse_core::{sync_events, AgentState, AgentStatus, EventType, SnapshotError};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Snapshot, SnapshotError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Snapshot, SnapshotError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl SnapshotSource for ScriptedSource {
        fn take_snapshot(&self) -> Result<Snapshot, SnapshotError> {
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Snapshot::empty(Utc::now())))
        }
    }

    fn agent(id: &str, tokens: u64) -> AgentState {
        let mut state = AgentState::new(id, AgentStatus::Active, Utc::now());
        state.total_tokens = tokens;
        state
    }

    fn failure() -> SnapshotError {
        SnapshotError::Malformed {
            path: PathBuf::from("/tmp/agents"),
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn ticks_broadcast_changes_and_publish_snapshot() {
        let source = ScriptedSource::new(vec![
            Ok(Snapshot::from_agents(Utc::now(), [agent("alpha", 1000)])),
            Err(failure()),
            Ok(Snapshot::from_agents(Utc::now(), [agent("alpha", 1500)])),
        ]);
        let broadcaster = Arc::new(Broadcaster::new());
        let channel = RecordingChannel::new();
        broadcaster.register(channel.clone()).await;
        let (snapshots, receiver) = snapshot_channel();
        let mut poll_loop = PollLoop::new(
            source,
            broadcaster,
            snapshots,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );

        assert_eq!(poll_loop.tick().await, 1);
        assert!(receiver.borrow().agent("alpha").is_some());
        assert_eq!(poll_loop.tick().await, 0);
        assert_eq!(receiver.borrow().total_tokens(), 1000);
        assert_eq!(poll_loop.tick().await, 1);

        let events = channel.events();
        let types = events.iter().map(|event| event.event_type).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![EventType::Heartbeat, EventType::AgentStarted, EventType::TokenUpdate]
        );
        assert_eq!(events[2].payload["delta"], 500);
        assert_eq!(receiver.borrow().total_tokens(), 1500);
    }

    #[tokio::test]
    async fn joiner_holding_the_gate_still_receives_the_next_changes() {
        let source = ScriptedSource::new(vec![Ok(Snapshot::from_agents(
            Utc::now(),
            [agent("alpha", 1000)],
        ))]);
        let broadcaster = Arc::new(Broadcaster::new());
        let (snapshots, receiver) = snapshot_channel();
        let mut poll_loop = PollLoop::new(
            source,
            broadcaster.clone(),
            snapshots,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );

        let gate = broadcaster.sync_guard().await;
        let tick = tokio::spawn(async move { poll_loop.tick().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.borrow().agent("alpha").is_none());

        let channel = RecordingChannel::new();
        let initial = sync_events(&receiver.borrow().clone(), Utc::now());
        assert!(initial.is_empty());
        broadcaster.register_with(channel.clone(), initial).await;
        drop(gate);

        let sent = tokio::time::timeout(Duration::from_secs(2), tick)
            .await
            .expect("tick finishes")
            .expect("join tick");
        assert_eq!(sent, 1);
        let types = channel
            .events()
            .iter()
            .map(|event| event.event_type)
            .collect::<Vec<_>>();
        assert_eq!(types, vec![EventType::Heartbeat, EventType::AgentStarted]);
        assert!(receiver.borrow().agent("alpha").is_some());
    }

    #[tokio::test]
    async fn unknown_model_read_keeps_last_known_model() {
        let mut first = agent("alpha", 10);
        first.current_model = "k2p5".to_string();
        let mut third = agent("alpha", 10);
        third.current_model = "claude-sonnet".to_string();
        let source = ScriptedSource::new(vec![
            Ok(Snapshot::from_agents(Utc::now(), [first])),
            Ok(Snapshot::from_agents(Utc::now(), [agent("alpha", 10)])),
            Ok(Snapshot::from_agents(Utc::now(), [third])),
        ]);
        let broadcaster = Arc::new(Broadcaster::new());
        let channel = RecordingChannel::new();
        broadcaster.register(channel.clone()).await;
        let (snapshots, receiver) = snapshot_channel();
        let mut poll_loop = PollLoop::new(
            source,
            broadcaster,
            snapshots,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );

        assert_eq!(poll_loop.tick().await, 1);
        assert_eq!(poll_loop.tick().await, 0);
        assert_eq!(receiver.borrow().agents["alpha"].current_model, "k2p5");
        assert_eq!(poll_loop.tick().await, 1);

        let events = channel.events();
        let switch = events.last().expect("model switch sent");
        assert_eq!(switch.event_type, EventType::ModelSwitched);
        assert_eq!(switch.payload["previousModel"], "k2p5");
        assert_eq!(switch.payload["model"], "claude-sonnet");
    }

    #[tokio::test]
    async fn shutdown_stops_loop_and_closes_channels() {
        let source = ScriptedSource::new(Vec::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let channel = RecordingChannel::new();
        broadcaster.register(channel.clone()).await;
        let (snapshots, _receiver) = snapshot_channel();
        let poll_loop = PollLoop::new(
            source,
            broadcaster.clone(),
            snapshots,
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop stops")
            .expect("join loop");

        assert_eq!(broadcaster.connection_count().await, 0);
        assert!(channel.is_closed());
        assert!(channel.pings.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
