//! Blocking SDO engine
//!
//! Implements the client side of the CiA 301 expedited and segmented
//! upload/download state machines. The protocol permits only one outstanding
//! transaction per server, so exchanges serialize on a per-node transaction
//! mutex. Responses arrive via the Core's receive thread, which feeds them
//! into a per-node channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmaster_common::messages::{CanId, CanMessage};
use canmaster_common::sdo::{SdoRequest, SdoResponse};
use canmaster_common::{constants, NodeId};
use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::core::SharedSender;
use crate::error::{ProtocolSnafu, ResponseTimeoutSnafu, SdoError, UnknownSnafu};

type Result<T> = std::result::Result<T, SdoError>;

struct NodeChannel {
    /// Held for the duration of one upload/download exchange
    transaction: Mutex<()>,
    tx: Sender<SdoResponse>,
    rx: Receiver<SdoResponse>,
}

impl NodeChannel {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            transaction: Mutex::new(()),
            tx,
            rx,
        }
    }
}

struct SdoEngineInner {
    sender: SharedSender,
    response_timeout: Duration,
    // Indexed by node ID 1..=127; slot 0 is unused
    nodes: Vec<NodeChannel>,
}

/// The SDO client engine, shared by all devices bound to one Core
#[derive(Clone)]
pub struct SdoEngine {
    inner: Arc<SdoEngineInner>,
}

impl SdoEngine {
    pub(crate) fn new(sender: SharedSender, response_timeout: Duration) -> Self {
        let nodes = (0..128).map(|_| NodeChannel::new()).collect();
        Self {
            inner: Arc::new(SdoEngineInner {
                sender,
                response_timeout,
                nodes,
            }),
        }
    }

    /// Feed an incoming SDO server response into the engine
    ///
    /// Called from the Core's receive thread for every frame in the
    /// 0x580..=0x5FF range.
    pub(crate) fn handle_response(&self, msg: CanMessage) {
        let node = (msg.id().raw() & 0x7F) as usize;
        if node == 0 {
            return;
        }
        match SdoResponse::try_from(msg) {
            Ok(resp) => {
                // The channel is unbounded and drained at transaction start,
                // so this cannot block the receive thread.
                let _ = self.inner.nodes[node].tx.send(resp);
            }
            Err(_) => {
                log::warn!("Malformed SDO response from node {node}, ignoring");
            }
        }
    }

    /// Read the value of an object from a slave's dictionary
    ///
    /// Performs an expedited or segmented upload depending on what the
    /// server initiates. One attempt; retries live in
    /// [`Device`](crate::Device).
    pub fn upload(&self, node: NodeId, index: u16, sub: u8) -> Result<Vec<u8>> {
        let chan = &self.inner.nodes[node.raw() as usize];
        let _transaction = chan.transaction.lock().unwrap();
        self.flush(chan);

        self.send(node, SdoRequest::initiate_upload(index, sub))?;

        let mut read_buf = Vec::new();
        let expedited = match self.wait_for_response(chan)? {
            SdoResponse::ConfirmUpload { n, e, s, data, .. } => {
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                }
                e
            }
            SdoResponse::Abort { abort_code, .. } => return Err(SdoError::Abort { abort_code }),
            other => return unexpected(node, other),
        };

        if !expedited {
            let mut toggle = false;
            loop {
                self.send(node, SdoRequest::upload_segment_request(toggle))?;
                match self.wait_for_response(chan)? {
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            self.abort_toggle(node, index, sub)?;
                            return ProtocolSnafu {
                                message: format!(
                                    "node {node}: toggle bit not alternated in upload segment"
                                ),
                            }
                            .fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            break;
                        }
                    }
                    SdoResponse::Abort { abort_code, .. } => {
                        return Err(SdoError::Abort { abort_code })
                    }
                    other => return unexpected(node, other),
                }
                toggle = !toggle;
            }
        }
        Ok(read_buf)
    }

    /// Write a value to an object in a slave's dictionary
    ///
    /// Data of up to 4 bytes is sent expedited; anything longer uses a
    /// segmented download.
    pub fn download(&self, node: NodeId, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let chan = &self.inner.nodes[node.raw() as usize];
        let _transaction = chan.transaction.lock().unwrap();
        self.flush(chan);

        if data.len() <= 4 {
            self.send(node, SdoRequest::expedited_download(index, sub, data))?;
            match self.wait_for_response(chan)? {
                SdoResponse::ConfirmDownload { .. } => Ok(()),
                SdoResponse::Abort { abort_code, .. } => Err(SdoError::Abort { abort_code }),
                other => unexpected(node, other),
            }
        } else {
            self.send(
                node,
                SdoRequest::initiate_download(index, sub, data.len() as u32),
            )?;
            match self.wait_for_response(chan)? {
                SdoResponse::ConfirmDownload { .. } => (),
                SdoResponse::Abort { abort_code, .. } => {
                    return Err(SdoError::Abort { abort_code })
                }
                other => return unexpected(node, other),
            }

            let mut toggle = false;
            let total_segments = data.len().div_ceil(7);
            for seg in 0..total_segments {
                let last_segment = seg == total_segments - 1;
                let segment_size = (data.len() - seg * 7).min(7);
                self.send(
                    node,
                    SdoRequest::download_segment(
                        toggle,
                        last_segment,
                        &data[seg * 7..seg * 7 + segment_size],
                    ),
                )?;
                match self.wait_for_response(chan)? {
                    SdoResponse::ConfirmDownloadSegment { t } => {
                        if t != toggle {
                            self.abort_toggle(node, index, sub)?;
                            return ProtocolSnafu {
                                message: format!(
                                    "node {node}: toggle bit not alternated in download confirm"
                                ),
                            }
                            .fail();
                        }
                    }
                    SdoResponse::Abort { abort_code, .. } => {
                        return Err(SdoError::Abort { abort_code })
                    }
                    other => return unexpected(node, other),
                }
                toggle = !toggle;
            }
            Ok(())
        }
    }

    fn send(&self, node: NodeId, request: SdoRequest) -> Result<()> {
        let cob_id = CanId::std(constants::SDO_REQ_BASE + node.raw() as u16);
        self.inner
            .sender
            .send(request.to_can_message(cob_id))
            .map_err(|e| {
                UnknownSnafu {
                    message: format!("node {node}: failed to send SDO request: {e}"),
                }
                .build()
            })
    }

    fn abort_toggle(&self, node: NodeId, index: u16, sub: u8) -> Result<()> {
        self.send(
            node,
            SdoRequest::abort(
                index,
                sub,
                canmaster_common::sdo::AbortCode::ToggleNotAlternated,
            ),
        )
    }

    fn flush(&self, chan: &NodeChannel) {
        while chan.rx.try_recv().is_ok() {}
    }

    fn wait_for_response(&self, chan: &NodeChannel) -> Result<SdoResponse> {
        chan.rx
            .recv_timeout(self.inner.response_timeout)
            .map_err(|_| {
                ResponseTimeoutSnafu {
                    message: "no SDO response within timeout".to_string(),
                }
                .build()
            })
    }
}

fn unexpected<T>(node: NodeId, resp: SdoResponse) -> Result<T> {
    ProtocolSnafu {
        message: format!("node {node}: unexpected SDO response {resp:?}"),
    }
    .fail()
}
