//! Set current mission item.
//!
//! Single request/confirm transaction: send MISSION_SET_CURRENT and wait for
//! a MISSION_CURRENT broadcast echoing the requested index. Broadcasts with
//! another index are stale announcements and are ignored. A negative index is
//! rejected before anything is sent.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mavlink::common::{MavMessage, MISSION_CURRENT_DATA, MISSION_SET_CURRENT_DATA};
use tracing::{debug, warn};

use crate::dispatcher::SubscriptionCookie;
use crate::timeout::TimeoutCookie;
use crate::types::{ResultCallback, TransferResult};
use crate::wire::msg_id;
use crate::work::{lock, Collaborators, Terminal, WorkItem, MAX_RETRIES, TARGET_COMPONENT_AUTOPILOT};

struct SetCurrentState {
    started: bool,
    done: bool,
    retries_done: u32,
    callback: Option<ResultCallback>,
    subscriptions: Vec<SubscriptionCookie>,
    timeout_cookie: Option<TimeoutCookie>,
}

impl SetCurrentState {
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

/// Moves the peer's current mission item to the requested index.
pub struct SetCurrentWorkItem {
    collab: Collaborators,
    current: i32,
    timeout: Duration,
    state: Mutex<SetCurrentState>,
    self_weak: Weak<SetCurrentWorkItem>,
}

impl SetCurrentWorkItem {
    pub(crate) fn new(
        collab: Collaborators,
        current: i32,
        timeout: Duration,
        callback: ResultCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            collab,
            current,
            timeout,
            state: Mutex::new(SetCurrentState {
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

    fn send_set_current(&self) -> bool {
        debug!(current = self.current, "set-current: sending request");
        self.collab
            .sender
            .send_message(&MavMessage::MISSION_SET_CURRENT(MISSION_SET_CURRENT_DATA {
                target_system: self.collab.sender.target_system_id(),
                target_component: TARGET_COMPONENT_AUTOPILOT,
                seq: self.current as u16,
            }))
    }

    fn process_mission_current(&self, data: &MISSION_CURRENT_DATA) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            if i32::from(data.seq) == self.current {
                Some(state.take_terminal(TransferResult::Success))
            } else {
                // Stale broadcast from before our request took effect.
                debug!(seq = data.seq, "set-current: ignoring stale broadcast");
                None
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
                warn!("set-current: retries exhausted");
                Some(state.take_terminal(TransferResult::Timeout))
            } else {
                state.retries_done += 1;
                debug!(retry = state.retries_done, "set-current: timeout, retrying");
                if self.send_set_current() {
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

impl WorkItem for SetCurrentWorkItem {
    fn start(&self) {
        let terminal = {
            let mut state = lock(&self.state);
            if state.started || state.done {
                return;
            }
            state.started = true;

            if self.current < 0 {
                Some(state.take_terminal(TransferResult::CurrentInvalid))
            } else {
                let weak = self.self_weak.clone();
                state.subscriptions.push(self.collab.dispatcher.subscribe(
                    msg_id::MISSION_CURRENT,
                    Arc::new(move |_header, message| {
                        if let (Some(item), MavMessage::MISSION_CURRENT(data)) =
                            (weak.upgrade(), message)
                        {
                            item.process_mission_current(data);
                        }
                    }),
                ));

                if self.send_set_current() {
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
