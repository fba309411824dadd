//! Mission download (client role).
//!
//! # Protocol flow
//!
//! 1. Engine sends MISSION_REQUEST_LIST
//! 2. Peer answers with MISSION_COUNT
//! 3. Engine requests each item with MISSION_REQUEST_INT, in sequence
//! 4. Peer answers each request with MISSION_ITEM_INT
//! 5. Engine closes the transaction with MISSION_ACK(ACCEPTED)
//!
//! A count of zero completes immediately with an empty list. A re-delivered
//! item for the previous sequence number is ignored as a retransmit. Each
//! step retries on timeout up to [`MAX_RETRIES`] times.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA,
};
use tracing::{debug, warn};

use crate::dispatcher::SubscriptionCookie;
use crate::timeout::TimeoutCookie;
use crate::types::{ItemInt, ProgressCallback, ResultAndItemsCallback, TransferResult};
use crate::wire::{self, msg_id};
use crate::work::{
    lock, Collaborators, TerminalWithItems, WorkItem, MAX_RETRIES, TARGET_COMPONENT_AUTOPILOT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    RequestList,
    RequestItem,
}

struct DownloadState {
    started: bool,
    done: bool,
    step: Step,
    items: Vec<ItemInt>,
    next_sequence: usize,
    expected_count: usize,
    retries_done: u32,
    callback: Option<ResultAndItemsCallback>,
    progress: Option<ProgressCallback>,
    subscriptions: Vec<SubscriptionCookie>,
    timeout_cookie: Option<TimeoutCookie>,
}

impl DownloadState {
    fn take_terminal(&mut self, result: TransferResult) -> TerminalWithItems {
        self.done = true;
        let items = if result == TransferResult::Success {
            std::mem::take(&mut self.items)
        } else {
            // Partial lists are discarded on every non-success path.
            Vec::new()
        };
        TerminalWithItems {
            result,
            items,
            callback: self.callback.take(),
            subscriptions: std::mem::take(&mut self.subscriptions),
            timeout_cookie: self.timeout_cookie.take(),
        }
    }

    fn update_progress(&mut self, value: f32) {
        if let Some(callback) = self.progress.as_mut() {
            callback(value);
        }
    }
}

/// Drives the client side of the mission download protocol.
pub struct DownloadWorkItem {
    collab: Collaborators,
    mission_type: u8,
    timeout: Duration,
    state: Mutex<DownloadState>,
    self_weak: Weak<DownloadWorkItem>,
}

impl DownloadWorkItem {
    pub(crate) fn new(
        collab: Collaborators,
        mission_type: u8,
        timeout: Duration,
        callback: ResultAndItemsCallback,
        progress: Option<ProgressCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            collab,
            mission_type,
            timeout,
            state: Mutex::new(DownloadState {
                started: false,
                done: false,
                step: Step::RequestList,
                items: Vec::new(),
                next_sequence: 0,
                expected_count: 0,
                retries_done: 0,
                callback: Some(callback),
                progress,
                subscriptions: Vec::new(),
                timeout_cookie: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    fn subscribe_all(&self, state: &mut DownloadState) {
        let weak = self.self_weak.clone();
        state.subscriptions.push(self.collab.dispatcher.subscribe(
            msg_id::MISSION_COUNT,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_COUNT(data)) = (weak.upgrade(), message) {
                    item.process_mission_count(data);
                }
            }),
        ));
        let weak = self.self_weak.clone();
        state.subscriptions.push(self.collab.dispatcher.subscribe(
            msg_id::MISSION_ITEM_INT,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_ITEM_INT(data)) = (weak.upgrade(), message)
                {
                    item.process_mission_item_int(data);
                }
            }),
        ));
        let weak = self.self_weak.clone();
        state.subscriptions.push(self.collab.dispatcher.subscribe(
            msg_id::MISSION_ACK,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_ACK(data)) = (weak.upgrade(), message) {
                    item.process_mission_ack(data);
                }
            }),
        ));
    }

    fn wire_mission_type(&self) -> MavMissionType {
        wire::mission_type_from_u8(self.mission_type)
            .unwrap_or(MavMissionType::MAV_MISSION_TYPE_MISSION)
    }

    fn send_request_list(&self) -> bool {
        debug!(
            mission_type = self.mission_type,
            "download: requesting mission list"
        );
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                mission_type: self.wire_mission_type(),
            }))
    }

    fn send_request_item(&self, seq: usize) -> bool {
        debug!(seq, "download: requesting mission item");
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                seq: seq as u16,
                mission_type: self.wire_mission_type(),
            }))
    }

    fn send_ack(&self, code: MavMissionResult) -> bool {
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                mavtype: code,
                mission_type: self.wire_mission_type(),
                opaque_id: 0,
            }))
    }

    fn arm_timeout(&self, state: &mut DownloadState) {
        let weak = self.self_weak.clone();
        state.timeout_cookie = Some(self.collab.scheduler.arm(
            self.timeout,
            Arc::new(move || {
                if let Some(item) = weak.upgrade() {
                    item.process_timeout();
                }
            }),
        ));
    }

    fn refresh_timeout(&self, state: &DownloadState) {
        if let Some(cookie) = state.timeout_cookie.as_ref() {
            self.collab.scheduler.refresh(cookie);
        }
    }

    fn process_mission_count(&self, data: &MISSION_COUNT_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if data.mission_type as u8 != self.mission_type {
                Some(state.take_terminal(TransferResult::MissionTypeNotConsistent))
            } else if state.step != Step::RequestList {
                // Retransmitted count; our first request likely got lost.
                self.refresh_timeout(&state);
                None
            } else if data.count == 0 {
                debug!("download: peer reports empty mission");
                if self.send_ack(MavMissionResult::MAV_MISSION_ACCEPTED) {
                    state.update_progress(1.0);
                    Some(state.take_terminal(TransferResult::Success))
                } else {
                    Some(state.take_terminal(TransferResult::ConnectionError))
                }
            } else {
                debug!(count = data.count, "download: received mission count");
                state.expected_count = data.count as usize;
                state.step = Step::RequestItem;
                state.retries_done = 0;
                state.update_progress(0.0);
                if self.send_request_item(0) {
                    self.refresh_timeout(&state);
                    None
                } else {
                    Some(state.take_terminal(TransferResult::ConnectionError))
                }
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }

    fn process_mission_item_int(&self, data: &MISSION_ITEM_INT_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done || state.step != Step::RequestItem {
                return;
            }
            if data.mission_type as u8 != self.mission_type {
                Some(state.take_terminal(TransferResult::MissionTypeNotConsistent))
            } else {
                let seq = data.seq as usize;
                if seq == state.next_sequence {
                    state.items.push(wire::item_from_wire(data));
                    state.next_sequence = seq + 1;
                    state.retries_done = 0;
                    let progress = state.next_sequence as f32 / state.expected_count as f32;
                    state.update_progress(progress);
                    if state.next_sequence == state.expected_count {
                        debug!(
                            count = state.expected_count,
                            "download: all items received"
                        );
                        if self.send_ack(MavMissionResult::MAV_MISSION_ACCEPTED) {
                            Some(state.take_terminal(TransferResult::Success))
                        } else {
                            Some(state.take_terminal(TransferResult::ConnectionError))
                        }
                    } else if self.send_request_item(state.next_sequence) {
                        self.refresh_timeout(&state);
                        None
                    } else {
                        Some(state.take_terminal(TransferResult::ConnectionError))
                    }
                } else if state.next_sequence > 0 && seq == state.next_sequence - 1 {
                    // Duplicate of the item we already stored; drop it.
                    debug!(seq, "download: ignoring duplicate item");
                    None
                } else {
                    warn!(
                        got = seq,
                        expected = state.next_sequence,
                        "download: item out of sequence"
                    );
                    Some(state.take_terminal(TransferResult::InvalidSequence))
                }
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }

    fn process_mission_ack(&self, data: &MISSION_ACK_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if data.mission_type as u8 != self.mission_type {
                Some(state.take_terminal(TransferResult::MissionTypeNotConsistent))
            } else if data.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED {
                // We close downloads ourselves; an accept from the peer here
                // makes no sense.
                warn!("download: unexpected accept from peer");
                Some(state.take_terminal(TransferResult::ProtocolError))
            } else {
                warn!(code = ?data.mavtype, "download: peer aborted with ack");
                Some(state.take_terminal(wire::ack_to_result(data.mavtype)))
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }

    fn process_timeout(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if state.retries_done >= MAX_RETRIES {
                warn!("download: retries exhausted");
                Some(state.take_terminal(TransferResult::Timeout))
            } else {
                state.retries_done += 1;
                debug!(retry = state.retries_done, "download: timeout, retrying");
                let sent = match state.step {
                    Step::RequestList => self.send_request_list(),
                    Step::RequestItem => self.send_request_item(state.next_sequence),
                };
                if sent {
                    self.refresh_timeout(&state);
                    None
                } else {
                    Some(state.take_terminal(TransferResult::ConnectionError))
                }
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }
}

impl WorkItem for DownloadWorkItem {
    fn start(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.started || state.done {
                return;
            }
            state.started = true;
            self.subscribe_all(&mut state);
            if self.send_request_list() {
                self.arm_timeout(&mut state);
                None
            } else {
                Some(state.take_terminal(TransferResult::ConnectionError))
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }

    fn cancel(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if state.started {
                let sent = self.send_ack(MavMissionResult::MAV_MISSION_OPERATION_CANCELLED);
                if !sent {
                    warn!("download: failed to send cancellation ack");
                }
            }
            state.take_terminal(TransferResult::Cancelled)
        };
        terminal.deliver();
    }

    fn has_started(&self) -> bool {
        lock(&self.state).started
    }

    fn is_done(&self) -> bool {
        lock(&self.state).done
    }
}
