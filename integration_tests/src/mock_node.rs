//! A scriptable mock CANopen slave
//!
//! Serves SDO uploads and downloads (expedited and segmented) from an
//! in-memory object store, records every write it confirms, and can be
//! switched unresponsive or primed to abort specific writes. Runs on its
//! own thread attached to a [`SimBus`](crate::sim_bus::SimBus) endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use canmaster_common::constants::{SDO_REQ_BASE, SDO_RESP_BASE};
use canmaster_common::messages::{CanId, CanMessage};
use canmaster_common::sdo::{AbortCode, SdoRequest, SdoResponse};
use canmaster_common::traits::{CanReceiver, CanRecvError, CanSender};

use crate::sim_bus::SimBus;

type ObjectMap = HashMap<(u16, u8), Vec<u8>>;

#[derive(Default)]
struct MockState {
    objects: Mutex<ObjectMap>,
    writes: Mutex<Vec<(u16, u8, Vec<u8>)>>,
    write_abort: Mutex<Option<(u16, u8, AbortCode)>>,
    responding: AtomicBool,
    request_count: AtomicUsize,
    terminating: AtomicBool,
}

/// Handle to a running mock slave
pub struct MockNode {
    state: Arc<MockState>,
    thread: Option<JoinHandle<()>>,
}

impl MockNode {
    /// Spawn a mock slave with the given node ID on the bus
    pub fn spawn(node_id: u8, bus: &SimBus) -> Self {
        let (sender, receiver) = bus.endpoint();
        let state = Arc::new(MockState {
            responding: AtomicBool::new(true),
            ..Default::default()
        });
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name(format!("mock-node-{node_id}"))
            .spawn(move || serve(node_id, thread_state, sender, receiver))
            .expect("failed to spawn mock node");
        Self {
            state,
            thread: Some(thread),
        }
    }

    /// Put an object into the store
    pub fn set_object(&self, index: u16, sub: u8, data: Vec<u8>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert((index, sub), data);
    }

    /// Read back an object from the store
    pub fn object(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state.objects.lock().unwrap().get(&(index, sub)).cloned()
    }

    /// Snapshot the whole object store
    pub fn objects_snapshot(&self) -> ObjectMap {
        self.state.objects.lock().unwrap().clone()
    }

    /// All confirmed writes, in order
    pub fn writes(&self) -> Vec<(u16, u8, Vec<u8>)> {
        self.state.writes.lock().unwrap().clone()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.state.writes.lock().unwrap().clear();
    }

    /// Toggle whether the node answers SDO requests at all
    pub fn set_responding(&self, responding: bool) {
        self.state.responding.store(responding, Ordering::SeqCst);
    }

    /// Make the node abort the next writes to the given object
    pub fn set_write_abort(&self, index: u16, sub: u8, code: AbortCode) {
        *self.state.write_abort.lock().unwrap() = Some((index, sub, code));
    }

    /// Number of upload/download transactions initiated by the master
    pub fn request_count(&self) -> usize {
        self.state.request_count.load(Ordering::SeqCst)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.state.terminating.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Transfers {
    upload: Option<UploadState>,
    download: Option<DownloadState>,
}

struct UploadState {
    data: Vec<u8>,
    pos: usize,
}

struct DownloadState {
    index: u16,
    sub: u8,
    data: Vec<u8>,
}

fn serve(
    node_id: u8,
    state: Arc<MockState>,
    mut sender: impl CanSender,
    mut receiver: impl CanReceiver,
) {
    let req_id = CanId::std(SDO_REQ_BASE + node_id as u16);
    let resp_id = CanId::std(SDO_RESP_BASE + node_id as u16);
    let mut transfers = Transfers {
        upload: None,
        download: None,
    };

    loop {
        let msg = match receiver.recv(Duration::from_millis(10)) {
            Ok(msg) => msg,
            Err(CanRecvError::Timeout) => {
                if state.terminating.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Err(CanRecvError::Disconnected) => return,
        };
        if msg.id() != req_id || msg.is_rtr() {
            continue;
        }
        let Ok(request) = SdoRequest::try_from(msg) else {
            continue;
        };
        if let Some(response) = handle_request(&state, &mut transfers, request) {
            sender
                .send(response.to_can_message(resp_id))
                .expect("mock node failed to send");
        }
    }
}

fn handle_request(
    state: &MockState,
    transfers: &mut Transfers,
    request: SdoRequest,
) -> Option<SdoResponse> {
    match request {
        SdoRequest::InitiateUpload { index, sub } => {
            state.request_count.fetch_add(1, Ordering::SeqCst);
            if !state.responding.load(Ordering::SeqCst) {
                return None;
            }
            let objects = state.objects.lock().unwrap();
            let Some(data) = objects.get(&(index, sub)) else {
                return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchObject));
            };
            if data.len() <= 4 {
                Some(SdoResponse::expedited_upload(index, sub, data))
            } else {
                transfers.upload = Some(UploadState {
                    data: data.clone(),
                    pos: 0,
                });
                Some(SdoResponse::upload_acknowledge(index, sub, data.len() as u32))
            }
        }
        SdoRequest::ReqUploadSegment { t } => {
            if !state.responding.load(Ordering::SeqCst) {
                return None;
            }
            let upload = transfers.upload.as_mut()?;
            let chunk_len = (upload.data.len() - upload.pos).min(7);
            let chunk = upload.data[upload.pos..upload.pos + chunk_len].to_vec();
            upload.pos += chunk_len;
            let complete = upload.pos >= upload.data.len();
            if complete {
                transfers.upload = None;
            }
            Some(SdoResponse::upload_segment(t, complete, &chunk))
        }
        SdoRequest::InitiateDownload {
            n,
            e,
            s,
            index,
            sub,
            data,
        } => {
            state.request_count.fetch_add(1, Ordering::SeqCst);
            if !state.responding.load(Ordering::SeqCst) {
                return None;
            }
            if e {
                let len = if s { 4 - n as usize } else { 4 };
                match commit_write(state, index, sub, data[0..len].to_vec()) {
                    Ok(()) => Some(SdoResponse::download_acknowledge(index, sub)),
                    Err(code) => Some(SdoResponse::abort(index, sub, code)),
                }
            } else {
                transfers.download = Some(DownloadState {
                    index,
                    sub,
                    data: Vec::new(),
                });
                Some(SdoResponse::download_acknowledge(index, sub))
            }
        }
        SdoRequest::DownloadSegment { t, n, c, data } => {
            if !state.responding.load(Ordering::SeqCst) {
                return None;
            }
            let download = transfers.download.as_mut()?;
            download.data.extend_from_slice(&data[0..7 - n as usize]);
            if c {
                let download = transfers.download.take().unwrap();
                match commit_write(state, download.index, download.sub, download.data) {
                    Ok(()) => Some(SdoResponse::download_segment_acknowledge(t)),
                    Err(code) => {
                        Some(SdoResponse::abort(download.index, download.sub, code))
                    }
                }
            } else {
                Some(SdoResponse::download_segment_acknowledge(t))
            }
        }
        SdoRequest::Abort { index, sub, .. } => {
            log::debug!("Mock node received abort for {index:#06X}sub{sub}");
            transfers.upload = None;
            transfers.download = None;
            None
        }
    }
}

fn commit_write(state: &MockState, index: u16, sub: u8, data: Vec<u8>) -> Result<(), AbortCode> {
    if let Some((abort_index, abort_sub, code)) = *state.write_abort.lock().unwrap() {
        if abort_index == index && abort_sub == sub {
            return Err(code);
        }
    }
    state
        .objects
        .lock()
        .unwrap()
        .insert((index, sub), data.clone());
    state.writes.lock().unwrap().push((index, sub, data));
    Ok(())
}
