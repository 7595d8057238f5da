//! i8042 keyboard controller stub.
//!
//! Only the status register matters to the boot path: the A20 enable
//! sequence polls it for "input buffer empty" before writing commands.
//! Data and command writes are accepted and dropped.

pub const I8042_DATA_PORT: u16 = 0x60;
pub const I8042_STATUS_PORT: u16 = 0x64;

/// Not busy, auxiliary data available.
pub const STATUS_READY: u8 = 0x1C;
