//! Event system for room state notifications
//!
//! Replaces per-object callbacks with one broadcast bus that UI layers and
//! tests subscribe to.

pub mod types;

pub use types::RoomEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting room events
///
/// # Example
///
/// ```no_run
/// use roomlink::events::{EventBus, RoomEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(RoomEvent::SignalingConnected);
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events without subscribers are dropped.
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses
    /// some events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
