use log::trace;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::logic::notification::Notifier;
use crate::model::ModelEvent;

/// Receives model events on the UI thread
pub trait ModelEventListener: Send + Sync {
    fn on_event(&self, event: &ModelEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ChannelListener {
    sender: mpsc::UnboundedSender<ModelEvent>,
}

impl ModelEventListener for ChannelListener {
    fn on_event(&self, event: &ModelEvent) {
        let _ = self.sender.send(event.clone());
    }
}

type Subscribers = Vec<(SubscriptionId, Arc<dyn ModelEventListener>)>;

/// Broadcasts model events through the notification queue
pub struct EventBus {
    notifier: Arc<Notifier>,
    subscribers: Arc<RwLock<Subscribers>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, listener: Arc<dyn ModelEventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, listener));
        id
    }

    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Receive every event posted after this call on a channel
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ModelEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.register(Arc::new(ChannelListener { sender }));
        (id, receiver)
    }

    /// Deliver to the subscribers registered at delivery time
    pub fn post(&self, event: ModelEvent) {
        trace!("Posting {} for {:?}", event.kind(), event.entity_ids());
        let subscribers = Arc::clone(&self.subscribers);
        self.notifier.notify(Box::new(move || {
            let listeners: Vec<Arc<dyn ModelEventListener>> =
                subscribers.read().iter().map(|(_, l)| Arc::clone(l)).collect();
            for listener in listeners {
                listener.on_event(&event);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityHandle, Invalidation};

    #[tokio::test]
    async fn test_channel_subscription_receives_events() {
        let notifier = Notifier::start().unwrap();
        let bus = EventBus::new(Arc::clone(&notifier));
        let (id, mut events) = bus.subscribe();

        let entity = EntityHandle::new(Entity::new(7, "Folder 7", "Folder"));
        bus.post(ModelEvent::EntityChanged(entity));
        bus.post(ModelEvent::EntityInvalidated(Invalidation::All));
        notifier.flush().await;

        assert_eq!(events.recv().await.unwrap().entity_ids(), vec![7]);
        assert!(events.recv().await.unwrap().is_total_invalidation());

        assert!(bus.unregister(id));
        bus.post(ModelEvent::EntityInvalidated(Invalidation::All));
        notifier.flush().await;
        assert!(events.try_recv().is_err());
    }
}
