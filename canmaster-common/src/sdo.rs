//! SDO wire protocol
//!
//! Message definitions for the CiA 301 service data object protocol:
//! expedited and segmented transfers in both directions, plus abort codes.
//! Byte 0 carries the command specifier, bytes 1-2 the index (little
//! endian), byte 3 the subindex, bytes 4-7 data.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// Client command specifiers (requests, master to slave)
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    ReqUploadSegment = 3,
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Server command specifiers (responses, slave to master)
enum ServerCommand {
    SegmentUpload = 0,
    SegmentDownload = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// SDO abort reasons
#[derive(Clone, Copy, Debug, PartialEq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource isn't available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

/// An SDO request, sent by the client (master) to a server (slave)
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object subindex
        sub: u8,
        /// Value when expedited, total size when e=0 and s=1
        data: [u8; 4],
    },
    /// Send the next segment of a download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested subindex
        sub: u8,
    },
    /// Request the next segment of an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Abort an ongoing transaction
    Abort {
        /// Object index of the active transaction
        index: u16,
        /// Subindex of the active transaction
        sub: u8,
        /// Abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download carrying up to 4 data bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a segmented download initiation announcing `size` bytes
    pub fn initiate_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create a `DownloadSegment` request
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an `InitiateUpload` request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create a `ReqUploadSegment` request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Encode as a CAN frame with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0u8; 8];
        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                put_multiplexer(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                put_multiplexer(&mut payload, index, sub);
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = ((ClientCommand::ReqUploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                put_multiplexer(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        CanMessage::new(id, &payload)
    }
}

impl TryFrom<CanMessage> for SdoRequest {
    type Error = AbortCode;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let value = msg.data();
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
        match ccs {
            ClientCommand::DownloadSegment => Ok(SdoRequest::DownloadSegment {
                t: (value[0] & (1 << 4)) != 0,
                n: (value[0] >> 1) & 0x7,
                c: (value[0] & 1) != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateDownload => Ok(SdoRequest::InitiateDownload {
                n: (value[0] >> 2) & 0x3,
                e: (value[0] & (1 << 1)) != 0,
                s: (value[0] & 1) != 0,
                index: get_index(value),
                sub: value[3],
                data: value[4..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload {
                index: get_index(value),
                sub: value[3],
            }),
            ClientCommand::ReqUploadSegment => Ok(SdoRequest::ReqUploadSegment {
                t: (value[0] & (1 << 4)) != 0,
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index: get_index(value),
                sub: value[3],
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}

/// An SDO response, sent by a server (slave) back to the client (master)
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The subindex being uploaded
        sub: u8,
        /// Value when expedited, total size when s=1
        data: [u8; 4],
    },
    /// An upload segment
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// The number of unused bytes in data
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// The index of the object written
        index: u16,
        /// The subindex written
        sub: u8,
    },
    /// Response to an [`SdoRequest::DownloadSegment`]
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Abort of an ongoing transaction
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Subindex of the active transfer
        sub: u8,
        /// Abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a `ConfirmUpload` response for an expedited upload
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoResponse::ConfirmUpload {
            n: 4 - data.len() as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a `ConfirmUpload` response announcing a segmented upload
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an `UploadSegment` response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment {
            t,
            n: (7 - data.len()) as u8,
            c,
            data: buf,
        }
    }

    /// Create a `ConfirmDownload` response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a `ConfirmDownloadSegment` response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Encode as a CAN frame with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0u8; 8];
        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                put_multiplexer(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::SegmentUpload as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                put_multiplexer(&mut payload, index, sub);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = ((ServerCommand::SegmentDownload as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                put_multiplexer(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        CanMessage::new(id, &payload)
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let value = msg.data();
        if value.len() < 8 {
            return Err(());
        }
        let scs: ServerCommand = (value[0] >> 5).try_into()?;
        match scs {
            ServerCommand::SegmentUpload => Ok(SdoResponse::UploadSegment {
                t: (value[0] & (1 << 4)) != 0,
                n: (value[0] >> 1) & 0x7,
                c: (value[0] & 1) != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ServerCommand::SegmentDownload => Ok(SdoResponse::ConfirmDownloadSegment {
                t: (value[0] & (1 << 4)) != 0,
            }),
            ServerCommand::Upload => Ok(SdoResponse::ConfirmUpload {
                n: (value[0] >> 2) & 0x3,
                e: (value[0] & (1 << 1)) != 0,
                s: (value[0] & 1) != 0,
                index: get_index(value),
                sub: value[3],
                data: value[4..8].try_into().unwrap(),
            }),
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload {
                index: get_index(value),
                sub: value[3],
            }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index: get_index(value),
                sub: value[3],
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}

fn put_multiplexer(payload: &mut [u8; 8], index: u16, sub: u8) {
    payload[1] = (index & 0xFF) as u8;
    payload[2] = (index >> 8) as u8;
    payload[3] = sub;
}

fn get_index(payload: &[u8]) -> u16 {
    u16::from_le_bytes(payload[1..3].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiate_upload_layout() {
        let msg = SdoRequest::initiate_upload(0x1000, 0).to_can_message(CanId::std(0x601));
        assert_eq!(&[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0], msg.data());
    }

    #[test]
    fn expedited_download_layout() {
        let msg = SdoRequest::expedited_download(0x6040, 0, &[0x0F, 0x00])
            .to_can_message(CanId::std(0x601));
        // ccs=1, n=2, e=1, s=1 -> 0x2B
        assert_eq!(&[0x2B, 0x40, 0x60, 0x00, 0x0F, 0x00, 0x00, 0x00], msg.data());
    }

    #[test]
    fn expedited_upload_response_decodes() {
        let msg = CanMessage::new(
            CanId::std(0x581),
            &[0x43, 0x00, 0x10, 0x00, 0x92, 0x01, 0x02, 0x00],
        );
        let resp = SdoResponse::try_from(msg).unwrap();
        match resp {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                assert_eq!((0, true, true), (n, e, s));
                assert_eq!((0x1000, 0), (index, sub));
                assert_eq!(131474u32, u32::from_le_bytes(data));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn request_codec_round_trip() {
        let cases = [
            SdoRequest::expedited_download(0x2000, 1, &[1, 2, 3]),
            SdoRequest::initiate_download(0x2000, 1, 32),
            SdoRequest::download_segment(true, false, &[1, 2, 3, 4, 5, 6, 7]),
            SdoRequest::initiate_upload(0x1018, 4),
            SdoRequest::upload_segment_request(true),
            SdoRequest::abort(0x1000, 0, AbortCode::NoSuchObject),
        ];
        for req in cases {
            let decoded = SdoRequest::try_from(req.to_can_message(CanId::std(0x601))).unwrap();
            assert_eq!(req, decoded);
        }
    }

    #[test]
    fn response_codec_round_trip() {
        let cases = [
            SdoResponse::expedited_upload(0x1000, 0, &[0x92, 0x01, 0x02, 0x00]),
            SdoResponse::upload_acknowledge(0x1008, 0, 16),
            SdoResponse::upload_segment(false, true, &[b'a', b'b', b'c']),
            SdoResponse::download_acknowledge(0x6040, 0),
            SdoResponse::download_segment_acknowledge(true),
            SdoResponse::abort(0x6040, 0, AbortCode::ReadOnly),
        ];
        for resp in cases {
            let decoded = SdoResponse::try_from(resp.to_can_message(CanId::std(0x581))).unwrap();
            assert_eq!(resp, decoded);
        }
    }

    #[test]
    fn abort_code_from_raw() {
        assert!(matches!(
            AbortCode::try_from(0x0602_0000u32),
            Ok(AbortCode::NoSuchObject)
        ));
        assert!(AbortCode::try_from(0xDEAD_BEEFu32).is_err());
    }
}
