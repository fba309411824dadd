//! Mission transfer engine.
//!
//! # Architecture
//!
//! The engine owns a FIFO queue of [`WorkItem`]s so that only one transfer
//! runs on the link at a time. Submissions enqueue an item and return a
//! non-owning [`TransferHandle`]; the owner drives the queue by calling
//! [`do_work`](MissionTransfer::do_work) from its loop, which drops finished
//! heads and starts the next pending item. The engine spawns no threads and
//! never blocks; all protocol activity happens in the items' message and
//! timeout handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::dispatcher::MessageDispatcher;
use crate::queue::LockedQueue;
use crate::sender::Sender;
use crate::timeout::TimeoutScheduler;
use crate::types::{
    ItemInt, ProgressCallback, ResultAndItemsCallback, ResultCallback, TimeoutSource,
};
use crate::work::clear::ClearWorkItem;
use crate::work::download::DownloadWorkItem;
use crate::work::receive::ReceiveIncomingWorkItem;
use crate::work::set_current::SetCurrentWorkItem;
use crate::work::upload::UploadWorkItem;
use crate::work::{Collaborators, WorkItem};

/// Non-owning reference to a queued transfer.
///
/// The engine owns the item until it finishes and is dropped from the queue;
/// afterwards the handle's queries report a done transfer and `cancel` is a
/// no-op.
pub struct TransferHandle {
    item: Weak<dyn WorkItem>,
}

impl TransferHandle {
    /// Abort the transfer; idempotent and safe from any thread.
    pub fn cancel(&self) {
        if let Some(item) = self.item.upgrade() {
            item.cancel();
        }
    }

    pub fn has_started(&self) -> bool {
        self.item.upgrade().map_or(true, |item| item.has_started())
    }

    pub fn is_done(&self) -> bool {
        self.item.upgrade().map_or(true, |item| item.is_done())
    }
}

/// Serializes mission transfers over one link.
pub struct MissionTransfer {
    sender: Arc<dyn Sender>,
    dispatcher: Arc<MessageDispatcher>,
    scheduler: Arc<TimeoutScheduler>,
    timeout_source: TimeoutSource,
    work_queue: LockedQueue<dyn WorkItem>,
    int_messages_supported: AtomicBool,
}

impl MissionTransfer {
    /// Build an engine on top of the link's sender, dispatcher and scheduler.
    ///
    /// `timeout_source` is sampled once per submission so per-transfer
    /// timeouts can track current link latency.
    pub fn new(
        sender: Arc<dyn Sender>,
        dispatcher: Arc<MessageDispatcher>,
        scheduler: Arc<TimeoutScheduler>,
        timeout_source: TimeoutSource,
    ) -> Self {
        Self {
            sender,
            dispatcher,
            scheduler,
            timeout_source,
            work_queue: LockedQueue::new(),
            int_messages_supported: AtomicBool::new(true),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            sender: Arc::clone(&self.sender),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    fn enqueue(&self, item: Arc<dyn WorkItem>) -> TransferHandle {
        let handle = TransferHandle {
            item: Arc::downgrade(&item),
        };
        self.work_queue.push_back(item);
        handle
    }

    /// Queue an upload of `items` to the peer.
    pub fn upload_items_async(
        &self,
        mission_type: u8,
        items: Vec<ItemInt>,
        callback: ResultCallback,
        progress: Option<ProgressCallback>,
    ) -> TransferHandle {
        let item = UploadWorkItem::new(
            self.collaborators(),
            mission_type,
            self.int_messages_supported.load(Ordering::SeqCst),
            items,
            (self.timeout_source)(),
            callback,
            progress,
        );
        self.enqueue(item)
    }

    /// Queue a download of the peer's list of the given mission type.
    pub fn download_items_async(
        &self,
        mission_type: u8,
        callback: ResultAndItemsCallback,
        progress: Option<ProgressCallback>,
    ) -> TransferHandle {
        let item = DownloadWorkItem::new(
            self.collaborators(),
            mission_type,
            (self.timeout_source)(),
            callback,
            progress,
        );
        self.enqueue(item)
    }

    /// Queue the server-side pull of a list a peer has announced with
    /// MISSION_COUNT (`mission_count` items from `target_component`).
    pub fn receive_incoming_items_async(
        &self,
        mission_type: u8,
        mission_count: u32,
        target_component: u8,
        callback: ResultAndItemsCallback,
    ) -> TransferHandle {
        let item = ReceiveIncomingWorkItem::new(
            self.collaborators(),
            mission_type,
            mission_count,
            target_component,
            (self.timeout_source)(),
            callback,
        );
        self.enqueue(item)
    }

    /// Queue a clear of the peer's list of the given mission type.
    pub fn clear_items_async(&self, mission_type: u8, callback: ResultCallback) {
        let item = ClearWorkItem::new(
            self.collaborators(),
            mission_type,
            (self.timeout_source)(),
            callback,
        );
        self.enqueue(item);
    }

    /// Queue a change of the peer's current mission item.
    pub fn set_current_item_async(&self, current: i32, callback: ResultCallback) {
        let item = SetCurrentWorkItem::new(
            self.collaborators(),
            current,
            (self.timeout_source)(),
            callback,
        );
        self.enqueue(item);
    }

    /// Non-blocking driver step.
    ///
    /// Drops finished items off the head of the queue and starts the next
    /// pending one. Call this from the owner's loop; items that finish
    /// synchronously (preflight failures, cancelled before start) are
    /// collected in the same step.
    pub fn do_work(&self) {
        loop {
            let Some(head) = self.work_queue.front() else {
                return;
            };
            if head.is_done() {
                self.work_queue.pop_front_if(&head);
                continue;
            }
            if !head.has_started() {
                head.start();
                if head.is_done() {
                    self.work_queue.pop_front_if(&head);
                    continue;
                }
            }
            return;
        }
    }

    /// True when no transfer is queued or running.
    pub fn is_idle(&self) -> bool {
        self.work_queue.is_empty()
    }

    /// Record whether the peer speaks the MISSION_*_INT protocol variant.
    ///
    /// Read during upload preflight; uploads submitted while `false` fail
    /// with `IntMessagesNotSupported` before sending anything.
    pub fn set_int_messages_supported(&self, supported: bool) {
        self.int_messages_supported
            .store(supported, Ordering::SeqCst);
    }
}
