//! Master configuration

use std::time::Duration;

/// Timing and retry knobs for a [`Core`](crate::Core) and its devices
///
/// Passed explicitly at construction; there is no process-wide mutable
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// How long to wait for each SDO response segment
    pub sdo_response_timeout: Duration,
    /// Additional SDO attempts after the first timeout
    pub repeats_on_sdo_timeout: usize,
    /// How often the NMT layer checks device liveness
    pub alive_check_interval: Duration,
    /// Number of check intervals without a heartbeat before a device is
    /// considered dead
    pub dead_check_count: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            sdo_response_timeout: Duration::from_millis(1000),
            repeats_on_sdo_timeout: 2,
            alive_check_interval: Duration::from_millis(500),
            dead_check_count: 3,
        }
    }
}
