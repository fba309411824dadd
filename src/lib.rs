//! MAVLink mission transfer engine.
//!
//! Orchestrates the MAVLink mission micro-protocol between a ground station
//! and an autopilot over a lossy, unordered link: uploading, downloading and
//! clearing mission/fence/rally item lists, accepting a peer-initiated
//! upload, and moving the current mission item. Each operation is a small
//! state machine with per-step retries, timeout handling, sequence
//! validation, cancellation and progress reporting; a FIFO work queue keeps
//! one transfer active per link at a time.
//!
//! The engine is purely reactive: it spawns no threads and never blocks. The
//! owner wires it to the link by feeding decoded frames into the
//! [`MessageDispatcher`], driving the [`TimeoutScheduler`] from a timer loop,
//! and calling [`MissionTransfer::do_work`] to advance the queue.

pub mod dispatcher;
pub mod queue;
pub mod sender;
pub mod timeout;
pub mod transfer;
pub mod types;
pub mod wire;
pub mod work;

pub use dispatcher::{MessageDispatcher, MessageHandler, SubscriptionCookie};
pub use queue::LockedQueue;
pub use sender::{Autopilot, Sender};
pub use timeout::{
    MockTime, MonotonicTime, TimeSource, TimeoutCallback, TimeoutCookie, TimeoutScheduler,
};
pub use transfer::{MissionTransfer, TransferHandle};
pub use types::{
    ItemError, ItemInt, ProgressCallback, ResultAndItemsCallback, ResultCallback, TimeoutSource,
    TransferResult,
};
pub use work::clear::ClearWorkItem;
pub use work::download::DownloadWorkItem;
pub use work::receive::ReceiveIncomingWorkItem;
pub use work::set_current::SetCurrentWorkItem;
pub use work::upload::UploadWorkItem;
pub use work::{WorkItem, MAX_RETRIES};
