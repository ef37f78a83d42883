//! Event bus (part of C10): publish/subscribe over record lifecycle
//! transitions, per `spec.md` §7 and §9 ("simple publish/subscribe
//! with a fixed set of event kinds; no reflection needed").

use tokio::sync::broadcast;

use crate::record::Flavor;

#[derive(Clone, Debug)]
pub enum Event {
    Set { flavor: Flavor, scope: String, key: String },
    Remove { flavor: Flavor, scope: String, key: String },
    Evict { flavor: Flavor, scope: String, key: String },
    Update { flavor: Flavor, scope: String, key: String },
}

/// Fixed-capacity broadcast bus. Subscribers that fall behind miss
/// the oldest events rather than back-pressuring publishers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error; the event is simply dropped.
        let _ = self.sender.send(event);
    }
}
