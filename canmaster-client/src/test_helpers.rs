//! Channel-backed driver stubs for unit tests

use std::time::Duration;

use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{CanReceiver, CanRecvError, CanSendError, CanSender};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

pub struct ChannelSender {
    tx: Sender<CanMessage>,
    // Keeps the channel open so sends cannot fail spuriously
    _keep_rx: Receiver<CanMessage>,
}

impl CanSender for ChannelSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.tx.send(msg).map_err(|_| CanSendError(msg))
    }
}

pub struct ChannelReceiver {
    rx: Receiver<CanMessage>,
    _keep_tx: Sender<CanMessage>,
}

impl CanReceiver for ChannelReceiver {
    fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }

    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, CanRecvError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => CanRecvError::Timeout,
            RecvTimeoutError::Disconnected => CanRecvError::Disconnected,
        })
    }
}

/// A detached driver: sent frames are captured nowhere, nothing is received
pub fn channel_pair() -> (ChannelSender, ChannelReceiver) {
    let (out_tx, out_rx) = unbounded();
    let (in_tx, in_rx) = unbounded();
    (
        ChannelSender {
            tx: out_tx,
            _keep_rx: out_rx,
        },
        ChannelReceiver {
            rx: in_rx,
            _keep_tx: in_tx,
        },
    )
}
