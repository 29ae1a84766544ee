//! CAN frame abstraction and CANopen broadcast message types

use snafu::Snafu;

use crate::constants::{self, HEARTBEAT_BASE, NMT_CMD_ID, SYNC_ID};

/// A CAN arbitration identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CanId {
    /// 29-bit extended identifier
    Extended(u32),
    /// 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the identifier bits regardless of flavor
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame: identifier, RTR flag, and up to 8 payload bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Payload storage; only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes (0..=8)
    pub dlc: u8,
    /// Arbitration ID
    pub id: CanId,
    /// Remote transmission request flag
    pub rtr: bool,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a data frame from a payload slice
    ///
    /// Panics if `data` exceeds 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if data.len() > MAX_DATA_LENGTH {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
        }
    }

    /// Create a remote (RTR) frame
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            ..Default::default()
        }
        .with_rtr()
    }

    fn with_rtr(mut self) -> Self {
        self.rtr = true;
        self
    }

    /// Get the arbitration ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true for a remote frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// NMT module control command specifiers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition the node to operational
    StartNode = 0x01,
    /// Transition the node to stopped
    StopNode = 0x02,
    /// Transition the node to pre-operational
    EnterPreOperational = 0x80,
    /// Reset the node application
    ResetNode = 0x81,
    /// Reset the node's communication layer
    ResetCommunication = 0x82,
}

impl NmtCommandSpecifier {
    /// Decode a command byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(Self::StartNode),
            0x02 => Ok(Self::StopNode),
            0x80 => Ok(Self::EnterPreOperational),
            0x81 => Ok(Self::ResetNode),
            0x82 => Ok(Self::ResetCommunication),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command message: command specifier plus target node (0 = broadcast)
#[derive(Debug, Clone, Copy)]
pub struct NmtCommand {
    /// The command to execute
    pub cmd: NmtCommandSpecifier,
    /// Target node ID, or 0 to address all nodes
    pub node: u8,
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(CanId::Std(NMT_CMD_ID), &[cmd.cmd as u8, cmd.node])
    }
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != CanId::Std(NMT_CMD_ID) {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: CanId::Std(NMT_CMD_ID),
            });
        }
        let payload = msg.data();
        if payload.len() < 2 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(NmtCommand {
            cmd: NmtCommandSpecifier::from_byte(payload[0])?,
            node: payload[1],
        })
    }
}

/// NMT states as reported in heartbeat messages
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Boot-up / initializing
    Initializing = 0x00,
    /// Stopped
    Stopped = 0x04,
    /// Operational
    Operational = 0x05,
    /// Vendor sleep state
    Sleep = 0x50,
    /// Vendor standby state
    Standby = 0x60,
    /// Pre-operational
    PreOperational = 0x7F,
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            0x00 => Ok(Initializing),
            0x04 => Ok(Stopped),
            0x05 => Ok(Operational),
            0x50 => Ok(Sleep),
            0x60 => Ok(Standby),
            0x7F => Ok(PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

/// A heartbeat (or node guard response) message
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    /// ID of the node which produced the heartbeat
    pub node: u8,
    /// Node guard toggle bit
    pub toggle: bool,
    /// Reported NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut state = value.state as u8;
        if value.toggle {
            state |= 1 << 7;
        }
        CanMessage::new(CanId::Std(HEARTBEAT_BASE | value.node as u16), &[state])
    }
}

/// A SYNC object
///
/// A single node acts as the SYNC producer, emitting a periodic sync object
/// consumed by all other nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncObject;

impl From<SyncObject> for CanMessage {
    fn from(_value: SyncObject) -> Self {
        CanMessage::new(CanId::Std(SYNC_ID), &[])
    }
}

/// A received CANopen broadcast message, classified by COB-ID
#[derive(Debug, Clone, Copy)]
pub enum CanOpenMessage {
    /// An NMT module control command
    NmtCommand(NmtCommand),
    /// A SYNC object
    Sync(SyncObject),
    /// A heartbeat from a node
    Heartbeat(Heartbeat),
}

impl TryFrom<CanMessage> for CanOpenMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id == CanId::Std(NMT_CMD_ID) {
            Ok(CanOpenMessage::NmtCommand(msg.try_into()?))
        } else if cob_id == CanId::Std(SYNC_ID) {
            Ok(CanOpenMessage::Sync(SyncObject))
        } else if constants::is_heartbeat_id(cob_id.raw() as u16) && !cob_id.is_extended() {
            if msg.data().is_empty() {
                return Err(MessageError::MessageTooShort);
            }
            let node = (cob_id.raw() & 0x7F) as u8;
            let toggle = (msg.data[0] & (1 << 7)) != 0;
            let state: NmtState = (msg.data[0] & 0x7F).try_into()?;
            Ok(CanOpenMessage::Heartbeat(Heartbeat {
                node,
                toggle,
                state,
            }))
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Errors raised when decoding received messages
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The message payload is shorter than its type requires
    MessageTooShort,
    /// A field in the message has an invalid value
    InvalidField,
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The ID found in the message
        cob_id: CanId,
        /// The ID required by the decoder
        expected: CanId,
    },
    /// The COB-ID does not belong to any known message type
    UnrecognizedId {
        /// The offending ID
        cob_id: CanId,
    },
    /// The NMT state byte is not a valid state
    InvalidNmtState {
        /// The offending state byte
        value: u8,
    },
}
