use crate::backoff::backoff_delay;
use crate::feed::{EventFeed, DEFAULT_FEED_CAPACITY};
use crate::view::ActivityView;
use futures_util::{SinkExt, StreamExt};
use pulse_core::WireEvent;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_FANOUT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Shutdown,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition rules for one logical connection, free of any I/O. The async
/// driver feeds it socket outcomes and timer firings.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    status: ConnectionStatus,
    attempts: u32,
    retry_pending: bool,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            attempts: 0,
            retry_pending: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn on_open(&mut self) -> bool {
        if self.status == ConnectionStatus::Shutdown {
            return false;
        }
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.retry_pending = false;
        true
    }

    /// Returns the delay of the one reconnect to schedule, or `None` when a
    /// retry is already pending or the client is shut down.
    pub fn on_close_or_error(&mut self) -> Option<Duration> {
        if self.status == ConnectionStatus::Shutdown || self.retry_pending {
            return None;
        }
        self.status = ConnectionStatus::Disconnected;
        let delay = backoff_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.retry_pending = true;
        Some(delay)
    }

    pub fn on_retry_fired(&mut self) -> bool {
        if self.status == ConnectionStatus::Shutdown || !self.retry_pending {
            return false;
        }
        self.retry_pending = false;
        self.status = ConnectionStatus::Connecting;
        true
    }

    pub fn shutdown(&mut self) {
        self.status = ConnectionStatus::Shutdown;
        self.retry_pending = false;
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub feed_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

struct Outputs {
    status: watch::Sender<ConnectionStatus>,
    view: watch::Sender<ActivityView>,
    feed: watch::Sender<EventFeed>,
    events: broadcast::Sender<WireEvent>,
}

impl Outputs {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn ingest(&self, text: &str) {
        let mut accepted = None;
        self.feed.send_if_modified(|feed| match feed.accept_frame(text) {
            Ok(event) => {
                accepted = Some(event);
                true
            }
            Err(err) => {
                warn!(event = "frame_rejected", error = %err);
                false
            }
        });
        let Some(event) = accepted else {
            return;
        };
        self.view
            .send_modify(|view| *view = std::mem::take(view).fold(&event));
        let _ = self.events.send(event);
    }
}

/// A running client. Dropping the handle without calling `shutdown` leaves
/// the connection task running until the runtime stops.
pub struct ClientHandle {
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Receiver<ActivityView>,
    feed: watch::Receiver<EventFeed>,
    events: broadcast::Sender<WireEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn spawn(config: ClientConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (view_tx, view_rx) = watch::channel(ActivityView::new());
        let (feed_tx, feed_rx) = watch::channel(EventFeed::new(config.feed_capacity));
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outputs = Outputs {
            status: status_tx,
            view: view_tx,
            feed: feed_tx,
            events: events_tx.clone(),
        };
        let task = tokio::spawn(drive(config.url, outputs, shutdown_rx));
        Self {
            status: status_rx,
            view: view_rx,
            feed: feed_rx,
            events: events_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn view(&self) -> watch::Receiver<ActivityView> {
        self.view.clone()
    }

    pub fn feed(&self) -> watch::Receiver<EventFeed> {
        self.feed.clone()
    }

    /// Every accepted event from now on, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    /// Cancels any pending reconnect, closes the socket and waits for the
    /// connection task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Shutdown,
}

async fn drive(url: String, outputs: Outputs, mut shutdown: watch::Receiver<bool>) {
    let mut machine = ReconnectState::new();
    loop {
        outputs.set_status(machine.status());
        debug!(event = "hub_connecting", url = %url);
        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };
        match connected {
            Ok((stream, _)) => {
                machine.on_open();
                outputs.set_status(machine.status());
                info!(event = "hub_connected", url = %url);
                if pump(stream, &outputs, &mut shutdown).await == SessionEnd::Shutdown {
                    break;
                }
            }
            Err(err) => {
                warn!(event = "hub_connect_error", url = %url, error = %err);
            }
        }

        let Some(delay) = machine.on_close_or_error() else {
            break;
        };
        outputs.set_status(machine.status());
        info!(
            event = "reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            attempt = machine.attempts()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
        if !machine.on_retry_fired() {
            break;
        }
    }
    machine.shutdown();
    outputs.set_status(machine.status());
    debug!(event = "client_stopped", url = %url);
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outputs: &Outputs,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
                return SessionEnd::Shutdown;
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => outputs.ingest(&text),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|frame| frame.reason.to_string()).unwrap_or_default();
                    info!(event = "hub_closed", reason = %reason);
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "hub_read_error", error = %err);
                    return SessionEnd::Disconnected;
                }
                None => return SessionEnd::Disconnected,
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
