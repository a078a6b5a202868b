//! SEM6000 wire protocol
//!
//! Frames exchanged with the plug over its vendor GATT service look like this:
//!
//! ```text
//! 0x0F | LEN | CODE (1-2 bytes) | PAYLOAD | CHECKSUM | 0xFF 0xFF
//! ```
//!
//! `LEN` counts the command code, the payload and the checksum byte. The
//! checksum is `1 + sum(code) + sum(payload)` truncated to one byte.
//!
//! [`command`] builds outgoing frames, [`response`] turns notifications back
//! into typed [`Response`] values and [`assembler`] joins frames that arrive
//! split over several notifications.

pub mod assembler;
pub mod command;
pub mod response;

pub use assembler::FrameAssembler;
pub use command::Command;
pub use response::{Availability, DailyData, DeviceEvent, Measurement, Response};

use uuid::Uuid;

/// Start marker of every frame
pub const FRAME_START: u8 = 0x0f;

/// End marker of every outgoing frame
pub const FRAME_END: [u8; 2] = [0xff, 0xff];

/// Vendor service carrying the write and notify characteristics
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// Characteristic commands are written to
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);

/// Characteristic the plug notifies responses on
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

/// Errors raised while building commands
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("PIN must consist of exactly 4 digits, got {length} characters")]
    InvalidPin { length: usize },

    #[error("Frame too large: {0} bytes do not fit into the length byte")]
    FrameTooLarge(usize),
}
