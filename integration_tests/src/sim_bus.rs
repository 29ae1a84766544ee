//! An in-process simulated CAN bus
//!
//! Every endpoint gets a sender/receiver pair sharing one tap ID; a frame
//! sent through an endpoint is delivered to every *other* endpoint, which
//! matches the behavior of a shared socketcan socket (a receiver does not
//! see its own sends).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{CanReceiver, CanRecvError, CanSendError, CanSender};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

type TapList = Arc<Mutex<Vec<(usize, Sender<CanMessage>)>>>;

/// A simulated bus to which any number of endpoints can attach
#[derive(Clone, Default)]
pub struct SimBus {
    taps: TapList,
    next_id: Arc<AtomicUsize>,
}

impl SimBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint
    pub fn endpoint(&self) -> (SimBusSender, SimBusReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.taps.lock().unwrap().push((id, tx));
        (
            SimBusSender {
                id,
                taps: self.taps.clone(),
            },
            SimBusReceiver { rx },
        )
    }
}

/// The sending half of a bus endpoint
#[derive(Clone)]
pub struct SimBusSender {
    id: usize,
    taps: TapList,
}

impl CanSender for SimBusSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        for (tap_id, tx) in self.taps.lock().unwrap().iter() {
            if *tap_id != self.id {
                // A closed endpoint just stops listening
                let _ = tx.send(msg);
            }
        }
        Ok(())
    }
}

/// The receiving half of a bus endpoint
pub struct SimBusReceiver {
    rx: Receiver<CanMessage>,
}

impl SimBusReceiver {
    /// Drop any pending frames
    pub fn flush(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Collect every frame arriving within `window`
    pub fn collect_for(&mut self, window: Duration) -> Vec<CanMessage> {
        let deadline = std::time::Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Ok(msg) = self.rx.recv_timeout(remaining) {
                frames.push(msg);
            }
        }
        frames
    }
}

impl CanReceiver for SimBusReceiver {
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
