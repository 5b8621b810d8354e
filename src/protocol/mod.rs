//! Vehicle telemetry/command protocol
//!
//! # Framing
//!
//! Every message, in both directions, is carried in one frame:
//!
//! ```text
//! ┌──────┬──────┬─────┬─────┬────────┬─────────┬─────────────┐
//! │ 0xEB │ 0x90 │ LEN │ SEQ │ MSG_ID │ payload │ CRC (2, BE) │
//! └──────┴──────┴─────┴─────┴────────┴─────────┴─────────────┘
//! ```
//!
//! - `LEN` counts everything after itself: SEQ + MSG_ID + payload + CRC
//! - `SEQ` is a wrapping sequence number assigned by the sender; outbound
//!   command SEQ doubles as the acknowledgment-correlation id
//! - `CRC` is a 16-bit word sum over SEQ through the end of the payload
//!
//! A datagram may carry several frames back to back. A corrupt frame is
//! skipped by resynchronizing on the sync pair; later frames in the same
//! datagram still decode.
//!
//! # Message catalog
//!
//! Inbound (vehicle → surface):
//!
//! | MSG_ID | Name            | Payload (LE)                            |
//! |--------|-----------------|-----------------------------------------|
//! | `0x00` | HEARTBEAT       | armed u8, mode u8                       |
//! | `0x0B` | BATTERY_STATUS  | voltage u16 (mV), current i16 (cA), remaining i8 (%) |
//! | `0x1E` | ATTITUDE        | roll f32, pitch f32, yaw f32 (rad)      |
//! | `0x29` | SCALED_PRESSURE | press_abs f32 (mbar), temperature i16 (c°C) |
//! | `0x4A` | VFR_HUD         | heading u16 (deg)                       |
//! | `0x4D` | COMMAND_ACK     | seq u8, result u8                       |
//!
//! Outbound (surface → vehicle):
//!
//! | MSG_ID | Name      | Payload                                      |
//! |--------|-----------|----------------------------------------------|
//! | `0x00` | HEARTBEAT | station type u8, reserved u8                 |
//! | `0x42` | COMMAND   | kind u8, kind-specific arguments             |

pub mod commands;
pub mod decoder;
pub mod frame;

pub use commands::TxFrame;
pub use decoder::{decode, CommandAck, DecodeOutput};
pub use frame::{checksum, encode_frame, Frame, FrameIter};

/// First sync byte
pub const SYNC_BYTE_1: u8 = 0xEB;
/// Second sync byte
pub const SYNC_BYTE_2: u8 = 0x90;

/// Heartbeat (both directions)
pub const MSG_HEARTBEAT: u8 = 0x00;
/// Battery voltage/current/remaining
pub const MSG_BATTERY_STATUS: u8 = 0x0B;
/// Attitude in radians
pub const MSG_ATTITUDE: u8 = 0x1E;
/// Absolute pressure and water temperature
pub const MSG_SCALED_PRESSURE: u8 = 0x29;
/// Heading summary
pub const MSG_VFR_HUD: u8 = 0x4A;
/// Command acknowledgment
pub const MSG_COMMAND_ACK: u8 = 0x4D;
/// Outbound command
pub const MSG_COMMAND: u8 = 0x42;

/// Command kind byte: arm
pub const CMD_ARM: u8 = 0x01;
/// Command kind byte: disarm
pub const CMD_DISARM: u8 = 0x02;
/// Command kind byte: set flight mode
pub const CMD_SET_MODE: u8 = 0x03;
/// Command kind byte: set lights level
pub const CMD_SET_LIGHTS: u8 = 0x04;

/// Station type carried in outbound heartbeats
pub const STATION_TYPE_SURFACE: u8 = 0x01;
