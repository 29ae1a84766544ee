//! Traits abstracting the CAN driver
//!
//! The master runs on plain threads, so both traits are blocking and object
//! safe. Backends: socketcan (behind the `socketcan` feature) for real
//! hardware, and channel-based simulations in tests.

use core::time::Duration;

use crate::messages::CanMessage;

/// Error returned when a send fails; carries the undelivered message
#[derive(Debug, Clone, Copy)]
pub struct CanSendError(pub CanMessage);

impl core::fmt::Display for CanSendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Failed to send CAN message with ID {:?}", self.0.id())
    }
}
impl std::error::Error for CanSendError {}

/// Error returned when a blocking receive times out or the bus goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanRecvError {
    /// No message arrived within the requested timeout
    Timeout,
    /// The underlying driver is closed or failed
    Disconnected,
}

impl core::fmt::Display for CanRecvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanRecvError::Timeout => write!(f, "Receive timed out"),
            CanRecvError::Disconnected => write!(f, "CAN driver disconnected"),
        }
    }
}
impl std::error::Error for CanRecvError {}

/// An object which can put frames on the bus
pub trait CanSender: Send {
    /// Send a single frame, best effort
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError>;
}

/// An object which can take frames off the bus
pub trait CanReceiver: Send {
    /// Return a pending frame if one is available
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// Block until a frame arrives or `timeout` elapses
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, CanRecvError>;
}
