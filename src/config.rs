//! Tunables of the partial flashing session.

use std::time::Duration;

/// Packets per acknowledged batch. Fixed by the partial flashing service.
pub const BATCH_SIZE: usize = 4;

/// Payload bytes carried by one WritePacket frame.
pub const DEFAULT_CHUNK_SIZE: usize = 16;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 8;

/// Session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashConfig {
    /// Bytes of program data per packet.
    pub chunk_size: usize,
    /// Wait for RegionInfo / StatusInfo.
    pub response_timeout: Duration,
    /// Wait for the acknowledgement of a batch.
    pub ack_timeout: Duration,
    /// Wait for the device to come back after the BLE-only reboot.
    pub reconnect_timeout: Duration,
    /// Resends of one rejected batch before giving up on partial flashing.
    pub max_write_retries: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
        }
    }
}
