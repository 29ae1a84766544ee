//! COB-ID allocation of the CiA 301 pre-defined connection set

/// NMT command COB-ID (master to all nodes)
pub const NMT_CMD_ID: u16 = 0x000;
/// SYNC COB-ID
pub const SYNC_ID: u16 = 0x080;
/// Base COB-ID for emergency messages (node ID is added)
pub const EMCY_BASE: u16 = 0x080;
/// Base COB-IDs for the four transmit PDOs (node ID is added)
pub const TPDO_BASES: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// Base COB-IDs for the four receive PDOs (node ID is added)
pub const RPDO_BASES: [u16; 4] = [0x200, 0x300, 0x400, 0x500];
/// Base COB-ID for SDO responses, server to client (node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base COB-ID for SDO requests, client to server (node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base COB-ID for heartbeat / node guard messages (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;

/// First COB-ID of the PDO range (TPDO1 of node 1)
pub const PDO_RANGE_START: u16 = 0x180;
/// Last COB-ID of the PDO range (RPDO4 of node 127)
pub const PDO_RANGE_END: u16 = 0x57F;

/// Returns true if the COB-ID falls into the process-data range
pub fn is_pdo_id(cob_id: u16) -> bool {
    (PDO_RANGE_START..=PDO_RANGE_END).contains(&cob_id)
}

/// Returns true if the COB-ID is an SDO server response (0x580..=0x5FF)
pub fn is_sdo_response_id(cob_id: u16) -> bool {
    cob_id & 0xFF80 == SDO_RESP_BASE
}

/// Returns true if the COB-ID is an SDO client request (0x600..=0x67F)
pub fn is_sdo_request_id(cob_id: u16) -> bool {
    cob_id & 0xFF80 == SDO_REQ_BASE
}

/// Returns true if the COB-ID is a heartbeat / node guard message
pub fn is_heartbeat_id(cob_id: u16) -> bool {
    cob_id & 0xFF80 == HEARTBEAT_BASE
}
