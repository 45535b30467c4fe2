use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use orch_types::Event;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Event),
    Ping,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct RunChannel {
    subscribers: Vec<Subscriber>,
    latest_event_id: i64,
    next_subscriber_id: u64,
}

/// In-process pub/sub keyed by `runId`. `subscribe` and `publish` share a
/// single lock so that the `latest_event_id` a subscriber observes at
/// attach time is exactly the watermark below which the Store already has
/// every event durably written (the Repository always persists before it
/// publishes) — giving the caller everything it needs to replay the gap
/// `(lastEventId, latest_event_id]` from the Store and then trust the live
/// stream for anything after, with no gap and no duplicate.
#[derive(Clone)]
pub struct EventBus {
    runs: Arc<Mutex<HashMap<String, RunChannel>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a new subscriber for `run_id` and returns the
    /// `latest_event_id` observed at the moment of registration, together
    /// with the receiver for events published from this point on.
    pub async fn subscribe(&self, run_id: &str) -> (i64, mpsc::Receiver<BusMessage>) {
        let mut runs = self.runs.lock().await;
        let channel = runs.entry(run_id.to_string()).or_default();
        let id = channel.next_subscriber_id;
        channel.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        channel.subscribers.push(Subscriber { id, tx });
        (channel.latest_event_id, rx)
    }

    pub async fn publish(&self, event: Event) {
        let mut runs = self.runs.lock().await;
        let channel = runs.entry(event.run_id.clone()).or_default();
        channel.latest_event_id = channel.latest_event_id.max(event.event_id);
        channel
            .subscribers
            .retain(|s| s.tx.try_send(BusMessage::Event(event.clone())).is_ok());
    }

    /// Delivers a keep-alive that bears no `eventId` and is never persisted.
    pub async fn publish_ping(&self, run_id: &str) {
        let mut runs = self.runs.lock().await;
        let Some(channel) = runs.get_mut(run_id) else {
            return;
        };
        channel
            .subscribers
            .retain(|s| s.tx.try_send(BusMessage::Ping).is_ok());
    }

    pub async fn subscriber_count(&self, run_id: &str) -> usize {
        self.runs
            .lock()
            .await
            .get(run_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: &str, id: i64) -> Event {
        let mut e = Event::new(run_id, "x", json!({}), "t".into());
        e.event_id = id;
        e
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let (latest, mut rx) = bus.subscribe("r1").await;
        assert_eq!(latest, 0);
        bus.publish(event("r1", 1)).await;
        bus.publish(event("r1", 2)).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (BusMessage::Event(a), BusMessage::Event(b)) => {
                assert_eq!(a.event_id, 1);
                assert_eq!(b.event_id, 2);
            }
            _ => panic!("expected events"),
        }
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped() {
        let bus = EventBus::new();
        let (_latest, _rx) = bus.subscribe("r1").await;
        for i in 1..=(SUBSCRIBER_QUEUE_CAPACITY as i64 + 10) {
            bus.publish(event("r1", i)).await;
        }
        assert_eq!(bus.subscriber_count("r1").await, 0);
    }

    #[tokio::test]
    async fn unrelated_runs_do_not_cross_deliver() {
        let bus = EventBus::new();
        let (_latest, mut rx_a) = bus.subscribe("a").await;
        let (_latest_b, mut rx_b) = bus.subscribe("b").await;
        bus.publish(event("a", 1)).await;
        let msg = rx_a.recv().await.unwrap();
        assert!(matches!(msg, BusMessage::Event(e) if e.run_id == "a"));
        assert!(rx_b.try_recv().is_err());
    }
}
