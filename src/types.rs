//! Core value types for mission transfers.
//!
//! # Mission Items
//!
//! [`ItemInt`] mirrors the MISSION_ITEM_INT wire format with raw integer
//! fields (scaled-integer coordinates for precision). It carries no dialect
//! enums so that lists can round-trip through the protocol without loss;
//! lifting raw values into `mavlink` enums happens at the wire boundary.
//!
//! # Outcomes
//!
//! Every transfer terminates with exactly one [`TransferResult`], delivered
//! through the terminal callback. Errors never cross handler boundaries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One mission element (waypoint or command) in MISSION_ITEM_INT form.
///
/// Coordinates use the scaled-integer convention: `x` is latitude in
/// degrees * 1e7, `y` is longitude in degrees * 1e7, `z` is altitude in
/// meters. Equality is structural over all thirteen fields.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ItemInt {
    /// Sequence number (0-indexed)
    pub seq: u16,
    /// Coordinate frame (MAV_FRAME_GLOBAL_RELATIVE_ALT, etc.)
    pub frame: u8,
    /// Command ID (MAV_CMD_NAV_WAYPOINT, etc.)
    pub command: u16,
    /// Current item flag (0=false, 1=true)
    pub current: u8,
    /// Autocontinue to next item (0=false, 1=true)
    pub autocontinue: u8,
    /// PARAM1 (command-specific)
    pub param1: f32,
    /// PARAM2 (command-specific)
    pub param2: f32,
    /// PARAM3 (command-specific)
    pub param3: f32,
    /// PARAM4 (command-specific)
    pub param4: f32,
    /// X coordinate (latitude in degrees * 1e7)
    pub x: i32,
    /// Y coordinate (longitude in degrees * 1e7)
    pub y: i32,
    /// Z coordinate (altitude in meters)
    pub z: f32,
    /// List domain this item belongs to (mission/fence/rally)
    pub mission_type: u8,
}

/// Terminal outcome of a mission transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    /// Transfer completed
    Success,
    /// The sender reported a failed send
    ConnectionError,
    /// Peer denied the operation
    Denied,
    /// List exceeds what the peer (or the count field) can hold
    TooManyMissionItems,
    /// Retries exhausted without a peer response
    Timeout,
    /// Peer does not support the operation or the int protocol variant
    Unsupported,
    /// An item uses a coordinate frame outside the accepted set
    UnsupportedFrame,
    /// Peer has no mission of the requested type
    NoMissionAvailable,
    /// Transfer was cancelled
    Cancelled,
    /// A message carried a different mission type than the transaction
    MissionTypeNotConsistent,
    /// Sequence numbers out of order beyond the retransmit window
    InvalidSequence,
    /// Requested current item index is invalid
    CurrentInvalid,
    /// Peer violated the protocol
    ProtocolError,
    /// Caller-supplied input cannot be represented on the wire
    InvalidParam,
    /// Peer lacks MISSION_*_INT support required by this engine
    IntMessagesNotSupported,
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferResult::Success => "success",
            TransferResult::ConnectionError => "connection error",
            TransferResult::Denied => "denied by peer",
            TransferResult::TooManyMissionItems => "too many mission items",
            TransferResult::Timeout => "timeout",
            TransferResult::Unsupported => "unsupported by peer",
            TransferResult::UnsupportedFrame => "unsupported coordinate frame",
            TransferResult::NoMissionAvailable => "no mission available",
            TransferResult::Cancelled => "cancelled",
            TransferResult::MissionTypeNotConsistent => "mission type not consistent",
            TransferResult::InvalidSequence => "invalid sequence",
            TransferResult::CurrentInvalid => "current item index invalid",
            TransferResult::ProtocolError => "protocol error",
            TransferResult::InvalidParam => "invalid parameter",
            TransferResult::IntMessagesNotSupported => "int messages not supported",
        };
        f.write_str(s)
    }
}

/// Failure to lift an [`ItemInt`] raw field into its dialect enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("coordinate frame {0} is not in the accepted set")]
    UnsupportedFrame(u8),

    #[error("command {0} is unknown to the dialect")]
    UnknownCommand(u16),

    #[error("mission type {0} is unknown to the dialect")]
    UnknownMissionType(u8),
}

impl From<ItemError> for TransferResult {
    fn from(err: ItemError) -> Self {
        match err {
            ItemError::UnsupportedFrame(_) => TransferResult::UnsupportedFrame,
            ItemError::UnknownCommand(_) | ItemError::UnknownMissionType(_) => {
                TransferResult::InvalidParam
            }
        }
    }
}

/// Terminal callback for transfers without a produced list.
pub type ResultCallback = Box<dyn FnOnce(TransferResult) + Send>;

/// Terminal callback for transfers that produce an item list.
///
/// The list is non-empty only on [`TransferResult::Success`]; failure and
/// cancellation discard any partially received items.
pub type ResultAndItemsCallback = Box<dyn FnOnce(TransferResult, Vec<ItemInt>) + Send>;

/// Progress observer; values are monotone nondecreasing in `[0, 1]`.
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Per-transfer timeout provider, sampled when a work item is built so the
/// value can track current link latency.
pub type TimeoutSource = Arc<dyn Fn() -> Duration + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seq: u16) -> ItemInt {
        ItemInt {
            seq,
            frame: 3,
            command: 16,
            current: 0,
            autocontinue: 1,
            param1: 0.0,
            param2: 5.0,
            param3: 0.0,
            param4: 0.0,
            x: 370000000,
            y: -1220000000,
            z: 100.0,
            mission_type: 0,
        }
    }

    #[test]
    fn test_item_structural_equality() {
        assert_eq!(item(0), item(0));
        assert_ne!(item(0), item(1));

        let mut other = item(0);
        other.param2 = 6.0;
        assert_ne!(item(0), other);
    }

    #[test]
    fn test_item_error_maps_to_result() {
        assert_eq!(
            TransferResult::from(ItemError::UnsupportedFrame(9)),
            TransferResult::UnsupportedFrame
        );
        assert_eq!(
            TransferResult::from(ItemError::UnknownCommand(65000)),
            TransferResult::InvalidParam
        );
        assert_eq!(
            TransferResult::from(ItemError::UnknownMissionType(7)),
            TransferResult::InvalidParam
        );
    }

    #[test]
    fn test_result_display() {
        assert_eq!(TransferResult::Success.to_string(), "success");
        assert_eq!(TransferResult::Timeout.to_string(), "timeout");
    }
}
