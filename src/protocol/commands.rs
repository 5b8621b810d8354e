//! Zero-allocation TX frame builder
//!
//! A single reusable buffer handles every outbound message. Create once,
//! reconfigure per command, send — no heap allocation on the TX path.

use crate::command::CommandKind;

use super::frame::checksum;
use super::{
    CMD_ARM, CMD_DISARM, CMD_SET_LIGHTS, CMD_SET_MODE, MSG_COMMAND, MSG_HEARTBEAT,
    STATION_TYPE_SURFACE, SYNC_BYTE_1, SYNC_BYTE_2,
};

/// Maximum outbound frame size (command with the largest argument list)
const MAX_TX_SIZE: usize = 16;

/// Reusable TX frame buffer for all outbound messages
pub struct TxFrame {
    data: [u8; MAX_TX_SIZE],
    len: usize,
}

impl TxFrame {
    /// Create a new frame with sync bytes pre-filled
    pub const fn new() -> Self {
        let mut data = [0u8; MAX_TX_SIZE];
        data[0] = SYNC_BYTE_1;
        data[1] = SYNC_BYTE_2;
        Self { data, len: 0 }
    }

    /// Get frame bytes for sending
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Configure as a surface-station heartbeat
    #[inline]
    pub fn set_heartbeat(&mut self, seq: u8) {
        self.data[3] = seq;
        self.data[4] = MSG_HEARTBEAT;
        self.data[5] = STATION_TYPE_SURFACE;
        self.data[6] = 0x00;
        self.finalize(2);
    }

    /// Configure as a command frame for the given kind
    ///
    /// `seq` is the acknowledgment-correlation id echoed back by the vehicle.
    #[inline]
    pub fn set_command(&mut self, seq: u8, kind: &CommandKind) {
        self.data[3] = seq;
        self.data[4] = MSG_COMMAND;
        let payload_len = match kind {
            CommandKind::Arm => {
                self.data[5] = CMD_ARM;
                1
            }
            CommandKind::Disarm => {
                self.data[5] = CMD_DISARM;
                1
            }
            CommandKind::SetMode { mode } => {
                self.data[5] = CMD_SET_MODE;
                self.data[6] = mode.code();
                2
            }
            CommandKind::SetLightsLevel { level } => {
                self.data[5] = CMD_SET_LIGHTS;
                self.data[6] = *level;
                2
            }
        };
        self.finalize(payload_len);
    }

    /// Compute the CRC and set the final frame length
    #[inline]
    fn finalize(&mut self, payload_len: usize) {
        self.data[2] = (payload_len + 4) as u8; // seq + msg_id + payload + crc
        let crc_pos = 5 + payload_len;
        let crc = checksum(&self.data[3..crc_pos]);
        self.data[crc_pos] = (crc >> 8) as u8;
        self.data[crc_pos + 1] = (crc & 0xFF) as u8;
        self.len = crc_pos + 2;
    }
}

impl Default for TxFrame {
    fn default() -> Self {
        Self::new()
    }
}
