use pulse_core::wire::{decode_frame, DEFAULT_MAX_FRAME_BYTES};
use pulse_core::{FrameError, WireEvent};
use std::collections::VecDeque;

pub const DEFAULT_FEED_CAPACITY: usize = 100;

/// The most recent accepted events, oldest first.
#[derive(Debug, Clone)]
pub struct EventFeed {
    events: VecDeque<WireEvent>,
    capacity: usize,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: WireEvent) {
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Validates one text frame and keeps it if well formed.
    pub fn accept_frame(&mut self, text: &str) -> Result<WireEvent, FrameError> {
        let event = decode_frame(text, DEFAULT_MAX_FRAME_BYTES)?;
        self.push(event.clone());
        Ok(event)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WireEvent> {
        self.events.iter()
    }

    pub fn latest(&self) -> Option<&WireEvent> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
