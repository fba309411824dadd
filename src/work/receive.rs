//! Server-side acceptance of a peer-initiated upload.
//!
//! The outer layer has already seen the unsolicited MISSION_COUNT and hands
//! us its count and the peer component. From there the flow is the download
//! pull pattern: request each item in sequence with MISSION_REQUEST_INT and
//! close with MISSION_ACK(ACCEPTED). A retransmitted MISSION_COUNT means the
//! peer did not see our request, so the current request is sent again.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA,
};
use tracing::{debug, warn};

use crate::dispatcher::SubscriptionCookie;
use crate::timeout::TimeoutCookie;
use crate::types::{ItemInt, ResultAndItemsCallback, TransferResult};
use crate::wire::{self, msg_id};
use crate::work::{lock, Collaborators, TerminalWithItems, WorkItem, MAX_RETRIES};

struct ReceiveState {
    started: bool,
    done: bool,
    items: Vec<ItemInt>,
    next_sequence: usize,
    retries_done: u32,
    callback: Option<ResultAndItemsCallback>,
    subscriptions: Vec<SubscriptionCookie>,
    timeout_cookie: Option<TimeoutCookie>,
}

impl ReceiveState {
    fn take_terminal(&mut self, result: TransferResult) -> TerminalWithItems {
        self.done = true;
        let items = if result == TransferResult::Success {
            std::mem::take(&mut self.items)
        } else {
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
}

/// Pulls a peer-announced item list into the local side.
pub struct ReceiveIncomingWorkItem {
    collab: Collaborators,
    mission_type: u8,
    expected_count: usize,
    /// Peer component that announced the list; all our messages go to it.
    target_component: u8,
    timeout: Duration,
    state: Mutex<ReceiveState>,
    self_weak: Weak<ReceiveIncomingWorkItem>,
}

impl ReceiveIncomingWorkItem {
    pub(crate) fn new(
        collab: Collaborators,
        mission_type: u8,
        mission_count: u32,
        target_component: u8,
        timeout: Duration,
        callback: ResultAndItemsCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            collab,
            mission_type,
            expected_count: mission_count as usize,
            target_component,
            timeout,
            state: Mutex::new(ReceiveState {
                started: false,
                done: false,
                items: Vec::new(),
                next_sequence: 0,
                retries_done: 0,
                callback: Some(callback),
                subscriptions: Vec::new(),
                timeout_cookie: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    fn subscribe_all(&self, state: &mut ReceiveState) {
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
            msg_id::MISSION_COUNT,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_COUNT(data)) = (weak.upgrade(), message) {
                    item.process_mission_count(data);
                }
            }),
        ));
    }

    fn wire_mission_type(&self) -> MavMissionType {
        wire::mission_type_from_u8(self.mission_type)
            .unwrap_or(MavMissionType::MAV_MISSION_TYPE_MISSION)
    }

    fn send_request_item(&self, seq: usize) -> bool {
        debug!(seq, "receive: requesting incoming item");
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: self.target_component,
                seq: seq as u16,
                mission_type: self.wire_mission_type(),
            }))
    }

    fn send_ack(&self, code: MavMissionResult) -> bool {
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: self.target_component,
                mavtype: code,
                mission_type: self.wire_mission_type(),
                opaque_id: 0,
            }))
    }

    fn arm_timeout(&self, state: &mut ReceiveState) {
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

    fn refresh_timeout(&self, state: &ReceiveState) {
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
            } else {
                // The peer re-announced the list; our request got lost.
                debug!("receive: count retransmitted, re-sending request");
                if self.send_request_item(state.next_sequence) {
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
            if state.done {
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
                    if state.next_sequence == self.expected_count {
                        debug!(
                            count = self.expected_count,
                            "receive: all incoming items stored"
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
                    debug!(seq, "receive: ignoring duplicate item");
                    None
                } else {
                    warn!(
                        got = seq,
                        expected = state.next_sequence,
                        "receive: item out of sequence"
                    );
                    Some(state.take_terminal(TransferResult::InvalidSequence))
                }
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
                warn!("receive: retries exhausted");
                Some(state.take_terminal(TransferResult::Timeout))
            } else {
                state.retries_done += 1;
                debug!(retry = state.retries_done, "receive: timeout, retrying");
                if self.send_request_item(state.next_sequence) {
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

impl WorkItem for ReceiveIncomingWorkItem {
    fn start(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.started || state.done {
                return;
            }
            state.started = true;

            if self.expected_count == 0 {
                // Nothing to pull; acknowledge the empty list right away.
                if self.send_ack(MavMissionResult::MAV_MISSION_ACCEPTED) {
                    Some(state.take_terminal(TransferResult::Success))
                } else {
                    Some(state.take_terminal(TransferResult::ConnectionError))
                }
            } else {
                self.subscribe_all(&mut state);
                if self.send_request_item(0) {
                    self.arm_timeout(&mut state);
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

    fn cancel(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if state.started {
                let sent = self.send_ack(MavMissionResult::MAV_MISSION_OPERATION_CANCELLED);
                if !sent {
                    warn!("receive: failed to send cancellation ack");
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
