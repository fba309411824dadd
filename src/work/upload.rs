//! Mission upload (client role).
//!
//! # Protocol flow
//!
//! 1. Engine sends MISSION_COUNT with the list length
//! 2. Peer requests each item with MISSION_REQUEST_INT, in sequence
//! 3. Engine answers each request with MISSION_ITEM_INT
//! 4. Peer closes the transaction with MISSION_ACK
//!
//! A peer that answers with the non-int MISSION_REQUEST cannot take int
//! items; the upload fails with `Unsupported`. A repeated request for the
//! previous sequence number is treated as a retransmit and answered again.
//! Each step retries on timeout up to [`MAX_RETRIES`] times.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA,
};
use tracing::{debug, warn};

use crate::dispatcher::SubscriptionCookie;
use crate::timeout::TimeoutCookie;
use crate::types::{ItemInt, ProgressCallback, ResultCallback, TransferResult};
use crate::wire::{self, msg_id};
use crate::work::{lock, Collaborators, Terminal, WorkItem, MAX_RETRIES, TARGET_COMPONENT_AUTOPILOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SendCount,
    SendItems,
}

struct UploadState {
    started: bool,
    done: bool,
    step: Step,
    /// Sequence number we expect the peer to request next
    next_sequence: usize,
    retries_done: u32,
    callback: Option<ResultCallback>,
    progress: Option<ProgressCallback>,
    subscriptions: Vec<SubscriptionCookie>,
    timeout_cookie: Option<TimeoutCookie>,
}

impl UploadState {
    fn take_terminal(&mut self, result: TransferResult) -> Terminal {
        self.done = true;
        Terminal {
            result,
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

/// Drives the client side of the mission upload protocol.
pub struct UploadWorkItem {
    collab: Collaborators,
    mission_type: u8,
    /// Engine flag sampled at construction; checked in preflight.
    int_messages_supported: bool,
    items: Vec<ItemInt>,
    timeout: Duration,
    state: Mutex<UploadState>,
    self_weak: Weak<UploadWorkItem>,
}

impl UploadWorkItem {
    pub(crate) fn new(
        collab: Collaborators,
        mission_type: u8,
        int_messages_supported: bool,
        items: Vec<ItemInt>,
        timeout: Duration,
        callback: ResultCallback,
        progress: Option<ProgressCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            collab,
            mission_type,
            int_messages_supported,
            items,
            timeout,
            state: Mutex::new(UploadState {
                started: false,
                done: false,
                step: Step::SendCount,
                next_sequence: 0,
                retries_done: 0,
                callback: Some(callback),
                progress,
                subscriptions: Vec::new(),
                timeout_cookie: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    fn preflight_error(&self) -> Option<TransferResult> {
        if !self.int_messages_supported {
            return Some(TransferResult::IntMessagesNotSupported);
        }
        if self
            .items
            .iter()
            .any(|item| item.mission_type != self.mission_type)
        {
            return Some(TransferResult::MissionTypeNotConsistent);
        }
        if self
            .items
            .iter()
            .enumerate()
            .any(|(index, item)| item.seq as usize != index)
        {
            return Some(TransferResult::InvalidSequence);
        }
        if self
            .items
            .iter()
            .any(|item| wire::frame_from_u8(item.frame).is_none())
        {
            return Some(TransferResult::UnsupportedFrame);
        }
        // The count field is u16; longer lists cannot be announced.
        if self.items.len() > u16::MAX as usize {
            return Some(TransferResult::TooManyMissionItems);
        }
        if wire::mission_type_from_u8(self.mission_type).is_none()
            || self
                .items
                .iter()
                .any(|item| wire::command_from_u16(item.command).is_none())
        {
            return Some(TransferResult::InvalidParam);
        }
        None
    }

    fn subscribe_all(&self, state: &mut UploadState) {
        let weak = self.self_weak.clone();
        state.subscriptions.push(self.collab.dispatcher.subscribe(
            msg_id::MISSION_REQUEST_INT,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_REQUEST_INT(data)) =
                    (weak.upgrade(), message)
                {
                    item.process_mission_request_int(data);
                }
            }),
        ));
        let weak = self.self_weak.clone();
        state.subscriptions.push(self.collab.dispatcher.subscribe(
            msg_id::MISSION_REQUEST,
            Arc::new(move |_header, message| {
                if let (Some(item), MavMessage::MISSION_REQUEST(data)) = (weak.upgrade(), message)
                {
                    item.process_mission_request(data);
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
        // Preflight rejects unknown tags before anything is sent.
        wire::mission_type_from_u8(self.mission_type)
            .unwrap_or(MavMissionType::MAV_MISSION_TYPE_MISSION)
    }

    fn send_count(&self) -> bool {
        debug!(
            count = self.items.len(),
            mission_type = self.mission_type,
            "upload: sending mission count"
        );
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                count: self.items.len() as u16,
                mission_type: self.wire_mission_type(),
                opaque_id: 0,
            }))
    }

    /// Answer a request for `seq`. Returns `None` on success, or the terminal
    /// result of a failed emission.
    fn send_item(&self, seq: usize) -> Option<TransferResult> {
        let Some(item) = self.items.get(seq) else {
            return Some(TransferResult::InvalidSequence);
        };
        let data = match wire::item_to_wire(
            item,
            self.collab.sender.target_system_id(),
            TARGET_COMPONENT_AUTOPILOT,
        ) {
            Ok(data) => data,
            // Preflight makes this unreachable; stay terminal rather than panic.
            Err(err) => return Some(err.into()),
        };
        debug!(seq, "upload: sending mission item");
        if self
            .collab
            .sender
            .send_message(&MavMessage::MISSION_ITEM_INT(data))
        {
            None
        } else {
            Some(TransferResult::ConnectionError)
        }
    }

    fn send_cancel(&self) {
        let sent = self
            .collab
            .sender
            .send_message(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                mavtype: MavMissionResult::MAV_MISSION_OPERATION_CANCELLED,
                mission_type: self.wire_mission_type(),
                opaque_id: 0,
            }));
        if !sent {
            warn!("upload: failed to send cancellation ack");
        }
    }

    fn arm_timeout(&self, state: &mut UploadState) {
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

    fn refresh_timeout(&self, state: &UploadState) {
        if let Some(cookie) = state.timeout_cookie.as_ref() {
            self.collab.scheduler.refresh(cookie);
        }
    }

    fn process_mission_request_int(&self, data: &MISSION_REQUEST_INT_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            let request_type = data.mission_type as u8;
            if request_type != self.mission_type {
                warn!(
                    got = request_type,
                    expected = self.mission_type,
                    "upload: request for different mission type"
                );
                Some(state.take_terminal(TransferResult::MissionTypeNotConsistent))
            } else {
                if state.step == Step::SendCount {
                    state.step = Step::SendItems;
                }
                let seq = data.seq as usize;
                if seq == state.next_sequence && seq < self.items.len() {
                    state.update_progress(seq as f32 / self.items.len() as f32);
                    match self.send_item(seq) {
                        None => {
                            state.next_sequence = seq + 1;
                            state.retries_done = 0;
                            self.refresh_timeout(&state);
                            None
                        }
                        Some(result) => Some(state.take_terminal(result)),
                    }
                } else if state.next_sequence > 0 && seq == state.next_sequence - 1 {
                    // Peer retried its last request; answer again, no advance.
                    debug!(seq, "upload: re-answering retried request");
                    match self.send_item(seq) {
                        None => {
                            self.refresh_timeout(&state);
                            None
                        }
                        Some(result) => Some(state.take_terminal(result)),
                    }
                } else {
                    warn!(
                        got = seq,
                        expected = state.next_sequence,
                        "upload: request out of sequence"
                    );
                    Some(state.take_terminal(TransferResult::InvalidSequence))
                }
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }

    fn process_mission_request(&self, data: &MISSION_REQUEST_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            warn!(
                seq = data.seq,
                "upload: peer uses non-int MISSION_REQUEST, not supported"
            );
            state.take_terminal(TransferResult::Unsupported)
        };
        terminal.deliver();
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
                if state.next_sequence == self.items.len() {
                    state.update_progress(1.0);
                    Some(state.take_terminal(TransferResult::Success))
                } else {
                    // Accepted before all items were requested: peer bug.
                    warn!(
                        confirmed = state.next_sequence,
                        total = self.items.len(),
                        "upload: premature accept"
                    );
                    Some(state.take_terminal(TransferResult::ProtocolError))
                }
            } else {
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
                warn!("upload: retries exhausted");
                Some(state.take_terminal(TransferResult::Timeout))
            } else {
                state.retries_done += 1;
                debug!(retry = state.retries_done, "upload: timeout, retrying");
                let failure = match state.step {
                    Step::SendCount => {
                        if self.send_count() {
                            None
                        } else {
                            Some(TransferResult::ConnectionError)
                        }
                    }
                    // Re-send the last item the peer asked for.
                    Step::SendItems => self.send_item(state.next_sequence.saturating_sub(1)),
                };
                match failure {
                    None => {
                        self.refresh_timeout(&state);
                        None
                    }
                    Some(result) => Some(state.take_terminal(result)),
                }
            }
        };
        if let Some(terminal) = terminal {
            terminal.deliver();
        }
    }
}

impl WorkItem for UploadWorkItem {
    fn start(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.started || state.done {
                return;
            }
            state.started = true;

            if let Some(result) = self.preflight_error() {
                Some(state.take_terminal(result))
            } else {
                self.subscribe_all(&mut state);
                if self.send_count() {
                    self.arm_timeout(&mut state);
                    state.update_progress(0.0);
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
                self.send_cancel();
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
