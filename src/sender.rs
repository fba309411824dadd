//! Outbound message emission contract.

use mavlink::common::MavMessage;

/// Autopilot flavor on the far end of the link.
///
/// The engine applies no flavor-specific policy itself; the field is part of
/// the sender identity so callers can make flavor decisions in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Autopilot {
    #[default]
    Unknown,
    Px4,
    ArduPilot,
}

/// Outbound message emission plus local and peer identity.
///
/// Implemented by the link layer. `send_message` returning `false` is
/// terminal for the running transfer (`ConnectionError`); the engine does not
/// retry sends because the transport is presumed healthy at this layer.
pub trait Sender: Send + Sync {
    /// Hand a message to the transport. Returns `false` on failure.
    fn send_message(&self, message: &MavMessage) -> bool;

    /// Our MAVLink system ID.
    fn own_system_id(&self) -> u8;

    /// Our MAVLink component ID.
    fn own_component_id(&self) -> u8;

    /// System ID of the peer we transfer with.
    fn target_system_id(&self) -> u8;

    /// Flavor of the peer autopilot, if known.
    fn autopilot(&self) -> Autopilot;
}
