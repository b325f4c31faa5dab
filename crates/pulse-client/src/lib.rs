//! Consumer side of the pulse hub: a reconnecting WebSocket client that keeps
//! a bounded feed of recent events and a folded per-agent activity view.

pub mod backoff;
pub mod feed;
pub mod reconnect;
pub mod view;

pub use backoff::backoff_delay;
pub use feed::{EventFeed, DEFAULT_FEED_CAPACITY};
pub use reconnect::{ClientConfig, ClientHandle, ConnectionStatus, ReconnectState};
pub use view::{ActivityView, AgentActivity, TokenUsage};

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:3503/ws";
