use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-tutor change feed of applied journal events.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one tutor's lessons and availability. Creates the channel on first use.
    pub fn subscribe(&self, tutor_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(tutor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op without subscribers.
    pub fn send(&self, tutor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&tutor_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn unsubscribe_all(&self, tutor_id: &Ulid) {
        self.channels.remove(tutor_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_tutor_events() {
        let hub = NotifyHub::new();
        let tutor = Ulid::new();
        let mut rx = hub.subscribe(tutor);

        let event = Event::SlotsPublished {
            tutor_id: tutor,
            date: 20157,
            hours: vec![10],
        };
        hub.send(tutor, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_tutors_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);
        let other = Ulid::new();
        hub.send(other, &Event::TutorRegistered { id: other, hourly_rate: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let tutor = Ulid::new();
        hub.send(tutor, &Event::TutorRegistered { id: tutor, hourly_rate: 1 });
        hub.unsubscribe_all(&tutor);
    }
}
