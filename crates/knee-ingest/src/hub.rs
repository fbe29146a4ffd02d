use crate::LiveEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_HUB_CAPACITY: usize = 256;

/// Publish/subscribe fan-out for live events.
///
/// Backed by a bounded broadcast ring: publishing never waits, and a
/// subscriber that falls more than `capacity` events behind loses the oldest
/// ones and is told how many it skipped. Publishing with no subscribers is
/// not an error.
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: LiveEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        debug!(subscribers = self.tx.receiver_count() + 1, "live subscriber attached");
        Subscription {
            rx: self.tx.subscribe(),
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

/// A live event stream. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<LiveEvent>,
    skipped: u64,
}

impl Subscription {
    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => self.note_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(_) => return None,
            }
        }
    }

    /// Events this subscriber lost by falling behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn note_lag(&mut self, n: u64) {
        self.skipped += n;
        warn!(skipped = n, "live subscriber lagged; oldest events dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(i: usize) -> LiveEvent {
        LiveEvent::Diagnostic {
            line: format!("line {i}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = LiveHub::new(4);
        assert_eq!(hub.publish(diag(0)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_every_event() {
        let hub = LiveHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.publish(diag(1)), 2);
        assert_eq!(a.recv().await, Some(diag(1)));
        assert_eq!(b.recv().await, Some(diag(1)));

        drop(b);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(diag(2)), 1);
        assert_eq!(a.try_recv(), Some(diag(2)));
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let hub = LiveHub::new(4);
        let mut slow = hub.subscribe();
        for i in 0..10 {
            hub.publish(diag(i));
        }
        // Only the newest `capacity` events remain.
        assert_eq!(slow.recv().await, Some(diag(6)));
        assert_eq!(slow.skipped(), 6);
        assert_eq!(slow.try_recv(), Some(diag(7)));
    }

    #[tokio::test]
    async fn test_closed_hub() {
        let hub = LiveHub::new(4);
        let mut sub = hub.subscribe();
        drop(hub);
        assert_eq!(sub.recv().await, None);
    }
}
