//! # Broadcast bus for debug-log lines.
//!
//! [`DebugLogBus`] is a thin wrapper around [`tokio::sync::broadcast`] that
//! provides non-blocking publishing of [`DebugLogEvent`]s from the host and
//! the per-worker listener tasks.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks or awaits.
//! - **Bounded capacity**: a single ring buffer stores recent events; slow
//!   receivers observe `RecvError::Lagged` and skip over missed lines.
//! - **No persistence**: lines published with no active subscriber are lost.
//!   High-volume console output is gated on [`DebugLogBus::has_subscribers`]
//!   so an unattended worker does not churn the ring buffer.

use tokio::sync::broadcast;

use super::event::{DebugLogEvent, DebugLogLevel};

/// Broadcast channel for per-connection debug-log lines.
///
/// Cheap to clone (internally holds an `Arc`-backed sender). Receivers get
/// lines for every connection; filter on
/// [`DebugLogEvent::connection_id`] at the consumer.
#[derive(Clone, Debug)]
pub struct DebugLogBus {
    tx: broadcast::Sender<DebugLogEvent>,
}

impl DebugLogBus {
    /// Creates a new bus with the given ring-buffer capacity (clamped to ≥ 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes one line to all active subscribers.
    ///
    /// If there are no receivers the line is dropped.
    pub fn publish(&self, event: DebugLogEvent) {
        let _ = self.tx.send(event);
    }

    /// Shorthand for publishing a freshly stamped line.
    pub fn log(&self, connection_id: &str, level: DebugLogLevel, line: impl Into<String>) {
        self.publish(DebugLogEvent::now(connection_id, level, line));
    }

    /// Creates a new independent receiver observing subsequent lines.
    pub fn subscribe(&self) -> broadcast::Receiver<DebugLogEvent> {
        self.tx.subscribe()
    }

    /// Returns true while at least one receiver is attached.
    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_lines() {
        let bus = DebugLogBus::new(16);
        let mut rx = bus.subscribe();

        bus.log("conn-1", DebugLogLevel::System, "** Connection started **");

        let event = rx.recv().await.expect("line delivered");
        assert_eq!(event.connection_id, "conn-1");
        assert_eq!(event.level, DebugLogLevel::System);
        assert_eq!(event.line, "** Connection started **");
    }

    #[tokio::test]
    async fn test_has_subscribers_tracks_receivers() {
        let bus = DebugLogBus::new(4);
        assert!(!bus.has_subscribers());

        let rx = bus.subscribe();
        assert!(bus.has_subscribers());

        drop(rx);
        assert!(!bus.has_subscribers());
    }
}
