//! Mission clear.
//!
//! Single request/ack transaction: send MISSION_CLEAR_ALL, await the peer's
//! MISSION_ACK, retry on timeout. Cancellation sends nothing; there is no
//! multi-message transaction for the peer to unwind.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA, MISSION_CLEAR_ALL_DATA,
};
use tracing::{debug, warn};

use crate::dispatcher::SubscriptionCookie;
use crate::timeout::TimeoutCookie;
use crate::types::{ResultCallback, TransferResult};
use crate::wire::{self, msg_id};
use crate::work::{lock, Collaborators, Terminal, WorkItem, MAX_RETRIES, TARGET_COMPONENT_AUTOPILOT};

struct ClearState {
    started: bool,
    done: bool,
    retries_done: u32,
    callback: Option<ResultCallback>,
    subscriptions: Vec<SubscriptionCookie>,
    timeout_cookie: Option<TimeoutCookie>,
}

impl ClearState {
    fn take_terminal(&mut self, result: TransferResult) -> Terminal {
        self.done = true;
        Terminal {
            result,
            callback: self.callback.take(),
            subscriptions: std::mem::take(&mut self.subscriptions),
            timeout_cookie: self.timeout_cookie.take(),
        }
    }
}

/// Clears the peer's stored list of the given mission type.
pub struct ClearWorkItem {
    collab: Collaborators,
    mission_type: u8,
    timeout: Duration,
    state: Mutex<ClearState>,
    self_weak: Weak<ClearWorkItem>,
}

impl ClearWorkItem {
    pub(crate) fn new(
        collab: Collaborators,
        mission_type: u8,
        timeout: Duration,
        callback: ResultCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            collab,
            mission_type,
            timeout,
            state: Mutex::new(ClearState {
                started: false,
                done: false,
                retries_done: 0,
                callback: Some(callback),
                subscriptions: Vec::new(),
                timeout_cookie: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    fn wire_mission_type(&self) -> MavMissionType {
        wire::mission_type_from_u8(self.mission_type)
            .unwrap_or(MavMissionType::MAV_MISSION_TYPE_MISSION)
    }

    fn send_clear(&self) -> bool {
        debug!(mission_type = self.mission_type, "clear: sending clear-all");
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                mission_type: self.wire_mission_type(),
            }))
    }

    fn process_mission_ack(&self, data: &MISSION_ACK_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if data.mission_type as u8 != self.mission_type {
                Some(state.take_terminal(TransferResult::MissionTypeNotConsistent))
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
                warn!("clear: retries exhausted");
                Some(state.take_terminal(TransferResult::Timeout))
            } else {
                state.retries_done += 1;
                debug!(retry = state.retries_done, "clear: timeout, retrying");
                if self.send_clear() {
                    if let Some(cookie) = state.timeout_cookie.as_ref() {
                        self.collab.scheduler.refresh(cookie);
                    }
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

impl WorkItem for ClearWorkItem {
    fn start(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.started || state.done {
                return;
            }
            state.started = true;

            let weak = self.self_weak.clone();
            state.subscriptions.push(self.collab.dispatcher.subscribe(
                msg_id::MISSION_ACK,
                Arc::new(move |_header, message| {
                    if let (Some(item), MavMessage::MISSION_ACK(data)) = (weak.upgrade(), message)
                    {
                        item.process_mission_ack(data);
                    }
                }),
            ));

            if self.send_clear() {
                let weak = self.self_weak.clone();
                state.timeout_cookie = Some(self.collab.scheduler.arm(
                    self.timeout,
                    Arc::new(move || {
                        if let Some(item) = weak.upgrade() {
                            item.process_timeout();
                        }
                    }),
                ));
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
