//! Observer fan-out
//!
//! Keeps the set of live administrative subscribers and pushes serialized
//! telemetry frames to all of them, best effort. A subscriber whose channel
//! errors is dropped on the spot. The most recent frame is cached so a new
//! observer sees data immediately instead of waiting out a poll interval.

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct HubInner {
    subscribers: Vec<(u64, mpsc::UnboundedSender<String>)>,
    next_id: u64,
    cached: Option<String>,
}

/// Broadcast hub for telemetry frames
pub struct ObserverHub {
    inner: Mutex<HubInner>,
}

impl ObserverHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                subscribers: Vec::new(),
                next_id: 0,
                cached: None,
            }),
        }
    }

    /// Register a new observer. The cached frame, when present, is delivered
    /// immediately through the returned receiver.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if let Some(frame) = inner.cached.clone() {
            let _ = tx.send(frame);
        }
        inner.subscribers.push((id, tx));
        (id, rx)
    }

    /// Remove an observer
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Deliver a frame to every observer, dropping the ones that error
    pub fn broadcast(&self, frame: String) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(frame.clone()).is_ok());
        inner.cached = Some(frame);
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Most recently broadcast frame
    pub fn cached_frame(&self) -> Option<String> {
        self.inner.lock().cached.clone()
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let hub = ObserverHub::new();
        let (_, mut rx1) = hub.subscribe();
        let (_, mut rx2) = hub.subscribe();

        hub.broadcast("frame-1".to_string());

        assert_eq!(rx1.try_recv().unwrap(), "frame-1");
        assert_eq!(rx2.try_recv().unwrap(), "frame-1");
    }

    #[test]
    fn test_new_subscriber_gets_cached_frame() {
        let hub = ObserverHub::new();
        hub.broadcast("stale-frame".to_string());

        let (_, mut rx) = hub.subscribe();
        assert_eq!(rx.try_recv().unwrap(), "stale-frame");
    }

    #[test]
    fn test_dead_subscriber_is_dropped_on_send() {
        let hub = ObserverHub::new();
        let (_, rx) = hub.subscribe();
        drop(rx);
        assert_eq!(hub.observer_count(), 1);

        hub.broadcast("frame".to_string());
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_target() {
        let hub = ObserverHub::new();
        let (id1, _rx1) = hub.subscribe();
        let (_id2, mut rx2) = hub.subscribe();

        hub.unsubscribe(id1);
        assert_eq!(hub.observer_count(), 1);

        hub.broadcast("frame".to_string());
        assert_eq!(rx2.try_recv().unwrap(), "frame");
    }
}
