//! Blocking socketcan backend
//!
//! Wraps a shared `socketcan::CanSocket` into a [`CanSender`]/[`CanReceiver`]
//! pair for use with the master library.

use std::sync::Arc;
use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};

use crate::messages::{CanId, CanMessage};
use crate::traits::{CanReceiver, CanRecvError, CanSendError, CanSender};

fn socketcan_id_to_can_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn can_id_to_socketcan_id(id: CanId) -> socketcan::CanId {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).unwrap().into(),
        CanId::Std(id) => socketcan::StandardId::new(id).unwrap().into(),
    }
}

fn socketcan_frame_to_message(frame: CanFrame) -> Option<CanMessage> {
    let id = socketcan_id_to_can_id(frame.can_id());
    match frame {
        CanFrame::Data(frame) => Some(CanMessage::new(id, frame.data())),
        CanFrame::Remote(_) => Some(CanMessage::new_rtr(id)),
        // Error frames carry no CANopen payload
        CanFrame::Error(_) => None,
    }
}

fn message_to_socketcan_frame(msg: CanMessage) -> CanFrame {
    let id = can_id_to_socketcan_id(msg.id());
    if msg.is_rtr() {
        CanFrame::new_remote(id, 0).unwrap()
    } else {
        CanFrame::new(id, msg.data()).unwrap()
    }
}

/// A socketcan-based CAN message sender
///
/// Multiple senders can share the same underlying socket through
/// `Arc<CanSocket>`.
#[derive(Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl CanSender for SocketCanSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.socket
            .write_frame(&message_to_socketcan_frame(msg))
            .map_err(|_| CanSendError(msg))
    }
}

/// A socketcan-based CAN message receiver
#[derive(Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

impl CanReceiver for SocketCanReceiver {
    fn try_recv(&mut self) -> Option<CanMessage> {
        match self.socket.read_frame_timeout(Duration::ZERO) {
            Ok(frame) => socketcan_frame_to_message(frame),
            Err(_) => None,
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, CanRecvError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.socket.read_frame_timeout(remaining) {
                Ok(frame) => {
                    // Error frames are skipped, not surfaced
                    if let Some(msg) = socketcan_frame_to_message(frame) {
                        return Ok(msg);
                    }
                }
                Err(e) => {
                    return match e.kind() {
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                            Err(CanRecvError::Timeout)
                        }
                        _ => Err(CanRecvError::Disconnected),
                    };
                }
            }
        }
    }
}

/// Open a socketcan device and split it into a sender and receiver object
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
///
/// Creating both sender and receiver from a shared socket means the receiver
/// will not see messages sent by the sender.
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> std::io::Result<(SocketCanSender, SocketCanReceiver)> {
    let socket = CanSocket::open(device.as_ref())?;
    let socket = Arc::new(socket);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
