//! Mission transfer work items.
//!
//! One work item is one protocol transaction: it owns its subscriptions and
//! its retry timer from `start` until it terminates, and evolves strictly one
//! event at a time under its own mutex. Items are single-use; once done they
//! never reactivate.
//!
//! # Serialization discipline
//!
//! Every externally triggered entry point (`start`, `cancel`, message
//! handler, timeout handler) locks the item's state for its entire body.
//! Handlers registered with the dispatcher and scheduler hold only a `Weak`
//! reference, and bail out if the item is gone or already done, so a delivery
//! racing termination has no observable effect.
//!
//! # Termination
//!
//! Every terminal path funnels through a [`Terminal`] (or
//! [`TerminalWithItems`]): the item is marked done and its cookies and
//! callback are moved out under the lock; the cookies are then dropped and
//! the callback invoked after the lock is released. This gives the documented
//! ordering (registrations released before the result callback) and lets the
//! callback re-enter the engine without deadlocking.

pub mod clear;
pub mod download;
pub mod receive;
pub mod set_current;
pub mod upload;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mavlink::common::MavComponent;

use crate::dispatcher::{MessageDispatcher, SubscriptionCookie};
use crate::sender::Sender;
use crate::timeout::{TimeoutCookie, TimeoutScheduler};
use crate::types::{ItemInt, ResultAndItemsCallback, ResultCallback, TransferResult};

/// Retries per timeout-driven step before a transfer fails with `Timeout`.
pub const MAX_RETRIES: u32 = 5;

/// Component we address mission traffic to on the peer system.
pub(crate) const TARGET_COMPONENT_AUTOPILOT: u8 = MavComponent::MAV_COMP_ID_AUTOPILOT1 as u8;

/// One queued mission sub-protocol transaction.
pub trait WorkItem: Send + Sync {
    /// Begin the transaction. Called once by the engine's driver step.
    fn start(&self);

    /// Abort the transaction; idempotent and safe from any thread.
    fn cancel(&self);

    fn has_started(&self) -> bool;

    fn is_done(&self) -> bool;
}

/// Shared collaborators handed to every work item.
///
/// All are non-owning in spirit: the item participates in, but does not own,
/// the link's sender, dispatcher and scheduler.
pub(crate) struct Collaborators {
    pub sender: Arc<dyn Sender>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub scheduler: Arc<TimeoutScheduler>,
}

/// Mutex lock that shrugs off poisoning; item state stays usable even if a
/// callback panicked on another thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deferred terminal delivery for result-only transfers.
pub(crate) struct Terminal {
    pub result: TransferResult,
    pub callback: Option<ResultCallback>,
    pub subscriptions: Vec<SubscriptionCookie>,
    pub timeout_cookie: Option<TimeoutCookie>,
}

impl Terminal {
    /// Release registrations, then fire the callback.
    pub fn deliver(self) {
        drop(self.subscriptions);
        drop(self.timeout_cookie);
        if let Some(callback) = self.callback {
            callback(self.result);
        }
    }
}

/// Deferred terminal delivery for list-producing transfers.
pub(crate) struct TerminalWithItems {
    pub result: TransferResult,
    pub items: Vec<ItemInt>,
    pub callback: Option<ResultAndItemsCallback>,
    pub subscriptions: Vec<SubscriptionCookie>,
    pub timeout_cookie: Option<TimeoutCookie>,
}

impl TerminalWithItems {
    pub fn deliver(self) {
        drop(self.subscriptions);
        drop(self.timeout_cookie);
        if let Some(callback) = self.callback {
            callback(self.result, self.items);
        }
    }
}
