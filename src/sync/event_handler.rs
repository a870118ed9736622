use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Observable outcomes of the offline layer
#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    ConnectivityChanged(bool),
    CachePopulated { entity: String, count: usize },
    CachePopulationFailed { entity: String, error: String },
    MutationQueued { id: i64, entity: String },
    MutationAcknowledged { id: i64 },
    ConflictDetected { conflict_id: i64, entity: String, entity_id: Option<String> },
    MutationDropped { id: i64, dead_letter_id: i64 },
}

pub type EventCallback = Arc<dyn Fn(OfflineEvent) + Send + Sync>;

/// Fan-out of `OfflineEvent`s to any number of listeners
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<OfflineEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: OfflineEvent) {
        // No listeners is fine
        if self.sender.send(event.clone()).is_err() {
            debug!("No listeners for {:?}", event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.sender.subscribe()
    }

    /// Register a callback invoked for every event until the hub is dropped
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(OfflineEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();

        hub.publish(OfflineEvent::MutationAcknowledged { id: 3 });
        assert_eq!(rx.recv().await.unwrap(), OfflineEvent::MutationAcknowledged { id: 3 });
    }

    #[tokio::test]
    async fn test_callback_listener() {
        let hub = EventHub::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        hub.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(OfflineEvent::ConnectivityChanged(false));
        hub.publish(OfflineEvent::ConnectivityChanged(true));

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_publish_without_listeners() {
        EventHub::new(4).publish(OfflineEvent::MutationAcknowledged { id: 1 });
    }
}
