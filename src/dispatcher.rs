//! Inbound message routing.
//!
//! # Architecture
//!
//! The dispatcher is the routing layer between the transport and the protocol
//! state machines: the link's receive loop feeds every decoded frame into
//! [`MessageDispatcher::process_message`], which invokes the handler of every
//! live subscription registered for that message ID.
//!
//! Handlers run outside the registry lock, so a handler may subscribe or drop
//! subscriptions (including its own) without deadlocking. A handler is never
//! invoked re-entrantly on the same subscription.
//!
//! # Cookies
//!
//! [`subscribe`](MessageDispatcher::subscribe) returns a
//! [`SubscriptionCookie`]; dropping it removes the registration. Release is
//! idempotent and safe to race with message delivery: a delivery that already
//! snapshotted the handler may still run once, so handlers guard on their own
//! terminal state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};

/// Handler invoked for each inbound message of a subscribed ID.
pub type MessageHandler = Arc<dyn Fn(&MavHeader, &MavMessage) + Send + Sync>;

struct Subscription {
    id: u64,
    message_id: u32,
    handler: MessageHandler,
}

#[derive(Default)]
struct Registry {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| s.id != id);
    }
}

/// Routes inbound MAVLink messages to per-message-ID subscribers.
#[derive(Default)]
pub struct MessageDispatcher {
    registry: Arc<Registry>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for all inbound messages with `message_id`.
    ///
    /// The registration lives as long as the returned cookie.
    pub fn subscribe(&self, message_id: u32, handler: MessageHandler) -> SubscriptionCookie {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self
            .registry
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscription {
            id,
            message_id,
            handler,
        });
        SubscriptionCookie {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Deliver one inbound message to every matching subscriber.
    pub fn process_message(&self, header: &MavHeader, message: &MavMessage) {
        let message_id = message.message_id();
        // Snapshot matching handlers so they run without the registry lock.
        let matching: Vec<MessageHandler> = {
            let subs = self
                .registry
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.iter()
                .filter(|s| s.message_id == message_id)
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in matching {
            handler(header, message);
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.registry
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Owned registration token; dropping it unsubscribes.
pub struct SubscriptionCookie {
    registry: Weak<Registry>,
    id: u64,
}

impl Drop for SubscriptionCookie {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
