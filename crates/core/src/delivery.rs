//! Real-time fan-out of persisted messages to subscribed sessions
//!
//! One logical channel per conversation, any number of subscribers. Each
//! subscriber gets its own FIFO queue drained by a dedicated task, so a slow
//! callback never reorders or blocks delivery to other sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::models::{ConversationId, Message, SenderRole};

/// Unique identifier of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Handler = Box<dyn FnMut(Message) + Send + 'static>;

/// Callback slot shared by a subscription handle and its delivery task.
/// The task holds the lock while the callback runs; unsubscribing empties
/// the slot under the same lock.
type HandlerSlot = Arc<Mutex<Option<Handler>>>;

struct Subscriber {
    id: SubscriberId,
    viewer: SenderRole,
    sender: UnboundedSender<Message>,
}

/// Registry of per-conversation subscribers
#[derive(Clone, Default)]
pub struct DeliveryHub {
    // conversation_id -> list of subscribers
    inner: Arc<Mutex<HashMap<ConversationId, Vec<Subscriber>>>>,
}

impl DeliveryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` to a conversation. Messages are passed through the
    /// viewer projection for `viewer` before delivery.
    ///
    /// Must be called from within a Tokio runtime. The handler must not
    /// unsubscribe its own subscription.
    pub fn subscribe<F>(
        &self,
        conversation_id: ConversationId,
        viewer: SenderRole,
        handler: F,
    ) -> Subscription
    where
        F: FnMut(Message) + Send + 'static,
    {
        let (tx, mut rx) = unbounded_channel::<Message>();
        let id = SubscriberId::new();
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(Box::new(handler))));

        let task_slot = slot.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let delivered = {
                    let mut guard = task_slot.lock().unwrap_or_else(|e| e.into_inner());
                    match guard.as_mut() {
                        Some(handler) => {
                            handler(message);
                            true
                        }
                        None => false,
                    }
                };
                if !delivered {
                    break;
                }
            }
        });

        {
            let mut guard = self.registry();
            let subscribers = guard.entry(conversation_id).or_default();
            subscribers.push(Subscriber {
                id,
                viewer,
                sender: tx,
            });
            debug!(
                conversation_id = %conversation_id,
                subscriber = ?id,
                total = subscribers.len(),
                "Subscriber added"
            );
        }

        Subscription {
            hub: self.clone(),
            conversation_id,
            id,
            slot,
        }
    }

    /// Deliver a persisted message to every subscriber of its conversation,
    /// in call order. Returns the number of subscribers it was queued for.
    pub fn publish(&self, message: &Message) -> usize {
        let mut guard = self.registry();
        let Some(subscribers) = guard.get_mut(&message.conversation_id) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.sender.send(message.for_viewer(s.viewer)).is_ok());
        let after = subscribers.len();

        if before != after {
            debug!(
                conversation_id = %message.conversation_id,
                dead = before - after,
                active = after,
                "Pruned dead subscribers"
            );
        }
        if subscribers.is_empty() {
            guard.remove(&message.conversation_id);
        }
        after
    }

    /// Number of live subscribers on a conversation
    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.registry()
            .get(&conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    fn remove(&self, conversation_id: ConversationId, id: SubscriberId) {
        let mut guard = self.registry();
        if let Some(subscribers) = guard.get_mut(&conversation_id) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                guard.remove(&conversation_id);
                debug!(conversation_id = %conversation_id, "Removed empty channel");
            }
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Vec<Subscriber>>> {
        // The registry holds no invariants a panicking holder could break
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    hub: DeliveryHub,
    conversation_id: ConversationId,
    id: SubscriberId,
    slot: HandlerSlot,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Stop delivery. Safe to call any number of times; once it returns the
    /// handler will not be invoked again.
    pub fn unsubscribe(&self) {
        self.hub.remove(self.conversation_id, self.id);
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            debug!(
                conversation_id = %self.conversation_id,
                subscriber = ?self.id,
                "Unsubscribed"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
