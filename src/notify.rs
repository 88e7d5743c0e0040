use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for store change notifications. Every committed event is
/// published on its space's channel and on a global firehose; LISTEN
/// subscriptions and embedded consumers (tests, future projections) hang
/// off these receivers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one space's events. Creates the channel if needed.
    pub fn subscribe(&self, space_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(space_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every event regardless of space.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Publish an event. No-op for channels nobody listens on.
    pub fn send(&self, space_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&space_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Remove a space channel (e.g. when the space is deleted).
    pub fn remove(&self, space_id: &Ulid) {
        self.channels.remove(space_id);
    }
}
