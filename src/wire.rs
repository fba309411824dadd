//! Wire-boundary helpers.
//!
//! Raw integer fields cross into `mavlink` dialect enums exactly here:
//! coordinate frames go through an explicit accept-list, command codes are
//! lifted with `FromPrimitive`, and MISSION_ACK codes map onto
//! [`TransferResult`]. Everything above this module works on raw values.

use mavlink::common::{MavCmd, MavFrame, MavMissionResult, MavMissionType, MISSION_ITEM_INT_DATA};
use num_traits::FromPrimitive;

use crate::types::{ItemError, ItemInt, TransferResult};

/// MAVLink message IDs consumed and produced by the engine.
pub mod msg_id {
    pub const MISSION_REQUEST: u32 = 40;
    pub const MISSION_SET_CURRENT: u32 = 41;
    pub const MISSION_CURRENT: u32 = 42;
    pub const MISSION_REQUEST_LIST: u32 = 43;
    pub const MISSION_COUNT: u32 = 44;
    pub const MISSION_CLEAR_ALL: u32 = 45;
    pub const MISSION_ACK: u32 = 47;
    pub const MISSION_REQUEST_INT: u32 = 51;
    pub const MISSION_ITEM_INT: u32 = 73;
}

/// Accepted coordinate frames for mission items.
///
/// Both the plain and the `_INT` variants of the global frames are accepted,
/// matching what autopilots produce for waypoint lists.
pub fn frame_from_u8(frame: u8) -> Option<MavFrame> {
    match frame {
        0 => Some(MavFrame::MAV_FRAME_GLOBAL),
        1 => Some(MavFrame::MAV_FRAME_LOCAL_NED),
        2 => Some(MavFrame::MAV_FRAME_MISSION),
        3 => Some(MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT),
        5 => Some(MavFrame::MAV_FRAME_GLOBAL_INT),
        6 => Some(MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT),
        10 => Some(MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT),
        11 => Some(MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT_INT),
        _ => None,
    }
}

pub fn mission_type_from_u8(mission_type: u8) -> Option<MavMissionType> {
    match mission_type {
        0 => Some(MavMissionType::MAV_MISSION_TYPE_MISSION),
        1 => Some(MavMissionType::MAV_MISSION_TYPE_FENCE),
        2 => Some(MavMissionType::MAV_MISSION_TYPE_RALLY),
        255 => Some(MavMissionType::MAV_MISSION_TYPE_ALL),
        _ => None,
    }
}

pub fn command_from_u16(command: u16) -> Option<MavCmd> {
    MavCmd::from_u16(command)
}

/// Map a MISSION_ACK code to a terminal result.
///
/// ACCEPTED maps to Success; whether an accept is valid at the point it
/// arrives is for the state machine to decide.
pub fn ack_to_result(code: MavMissionResult) -> TransferResult {
    match code {
        MavMissionResult::MAV_MISSION_ACCEPTED => TransferResult::Success,
        MavMissionResult::MAV_MISSION_ERROR => TransferResult::ProtocolError,
        MavMissionResult::MAV_MISSION_UNSUPPORTED_FRAME => TransferResult::UnsupportedFrame,
        MavMissionResult::MAV_MISSION_UNSUPPORTED => TransferResult::Unsupported,
        MavMissionResult::MAV_MISSION_NO_SPACE => TransferResult::TooManyMissionItems,
        MavMissionResult::MAV_MISSION_INVALID
        | MavMissionResult::MAV_MISSION_INVALID_PARAM1
        | MavMissionResult::MAV_MISSION_INVALID_PARAM2
        | MavMissionResult::MAV_MISSION_INVALID_PARAM3
        | MavMissionResult::MAV_MISSION_INVALID_PARAM4
        | MavMissionResult::MAV_MISSION_INVALID_PARAM5_X
        | MavMissionResult::MAV_MISSION_INVALID_PARAM6_Y
        | MavMissionResult::MAV_MISSION_INVALID_PARAM7 => TransferResult::ProtocolError,
        MavMissionResult::MAV_MISSION_INVALID_SEQUENCE => TransferResult::InvalidSequence,
        MavMissionResult::MAV_MISSION_DENIED => TransferResult::Denied,
        MavMissionResult::MAV_MISSION_OPERATION_CANCELLED => TransferResult::Cancelled,
    }
}

/// Convert a received MISSION_ITEM_INT into an [`ItemInt`].
///
/// Infallible: dialect enums narrow losslessly to their raw discriminants.
pub fn item_from_wire(data: &MISSION_ITEM_INT_DATA) -> ItemInt {
    ItemInt {
        seq: data.seq,
        frame: data.frame as u8,
        command: data.command as u16,
        current: data.current,
        autocontinue: data.autocontinue,
        param1: data.param1,
        param2: data.param2,
        param3: data.param3,
        param4: data.param4,
        x: data.x,
        y: data.y,
        z: data.z,
        mission_type: data.mission_type as u8,
    }
}

/// Build a MISSION_ITEM_INT from an [`ItemInt`], addressed to the given peer.
pub fn item_to_wire(
    item: &ItemInt,
    target_system: u8,
    target_component: u8,
) -> Result<MISSION_ITEM_INT_DATA, ItemError> {
    let frame = frame_from_u8(item.frame).ok_or(ItemError::UnsupportedFrame(item.frame))?;
    let command = command_from_u16(item.command).ok_or(ItemError::UnknownCommand(item.command))?;
    let mission_type = mission_type_from_u8(item.mission_type)
        .ok_or(ItemError::UnknownMissionType(item.mission_type))?;

    Ok(MISSION_ITEM_INT_DATA {
        target_system,
        target_component,
        seq: item.seq,
        frame,
        command,
        current: item.current,
        autocontinue: item.autocontinue,
        param1: item.param1,
        param2: item.param2,
        param3: item.param3,
        param4: item.param4,
        x: item.x,
        y: item.y,
        z: item.z,
        mission_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accept_list() {
        assert_eq!(frame_from_u8(3), Some(MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT));
        assert_eq!(frame_from_u8(0), Some(MavFrame::MAV_FRAME_GLOBAL));
        // Body-relative frames are not valid in mission lists
        assert_eq!(frame_from_u8(8), None);
        assert_eq!(frame_from_u8(200), None);
    }

    #[test]
    fn test_mission_type_mapping() {
        assert_eq!(
            mission_type_from_u8(0),
            Some(MavMissionType::MAV_MISSION_TYPE_MISSION)
        );
        assert_eq!(
            mission_type_from_u8(2),
            Some(MavMissionType::MAV_MISSION_TYPE_RALLY)
        );
        assert_eq!(mission_type_from_u8(17), None);
    }

    #[test]
    fn test_ack_code_mapping() {
        assert_eq!(
            ack_to_result(MavMissionResult::MAV_MISSION_ACCEPTED),
            TransferResult::Success
        );
        assert_eq!(
            ack_to_result(MavMissionResult::MAV_MISSION_NO_SPACE),
            TransferResult::TooManyMissionItems
        );
        assert_eq!(
            ack_to_result(MavMissionResult::MAV_MISSION_INVALID_PARAM5_X),
            TransferResult::ProtocolError
        );
        assert_eq!(
            ack_to_result(MavMissionResult::MAV_MISSION_OPERATION_CANCELLED),
            TransferResult::Cancelled
        );
    }

    #[test]
    fn test_item_round_trips_through_wire() {
        let item = ItemInt {
            seq: 4,
            frame: 6,
            command: 16,
            current: 1,
            autocontinue: 1,
            param1: 1.5,
            param2: 2.5,
            param3: 0.0,
            param4: 0.0,
            x: 473977418,
            y: 85455940,
            z: 50.0,
            mission_type: 0,
        };
        let wire = item_to_wire(&item, 1, 1).unwrap();
        assert_eq!(wire.seq, 4);
        assert_eq!(wire.frame, MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT);
        assert_eq!(item_from_wire(&wire), item);
    }

    #[test]
    fn test_item_to_wire_rejects_bad_frame() {
        let item = ItemInt {
            frame: 9,
            command: 16,
            ..Default::default()
        };
        assert_eq!(item_to_wire(&item, 1, 1), Err(ItemError::UnsupportedFrame(9)));
    }
}
