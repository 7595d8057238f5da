//! CPU core: architectural state, the ModR/M decoder, and the
//! instruction-at-a-time executor for the i386 subset this machine models.
//!
//! The executor is driven through [`interp::exec::step`], which retires
//! exactly one guest instruction (prefixes included) against a [`CpuBus`]
//! implementation supplied by the embedding machine.

pub mod bus;
pub mod decode;
pub mod flags;
pub mod interp;
pub mod state;

pub use bus::CpuBus;
pub use flags::Eflags;
pub use interp::exec::{step, StepExit};
pub use state::{CpuMode, CpuSnapshot, CpuState};

use thiserror::Error;

/// Fatal conditions the executor can surface.
///
/// Decode failures are unrecoverable: by the time the opcode is known to be
/// unhandled the fetch cursor has already moved past it. `eip` is the
/// address the instruction started at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("unhandled opcode {opcode:#04x} at eip {eip:#010x}")]
    UndefinedOpcode { eip: u32, opcode: u8 },

    #[error("unhandled opcode 0f {opcode:#04x} at eip {eip:#010x}")]
    UndefinedTwoByteOpcode { eip: u32, opcode: u8 },

    #[error("unhandled /{ext} form of group opcode {opcode:#04x} at eip {eip:#010x}")]
    UndefinedGroupOp { eip: u32, opcode: u8, ext: u8 },

    #[error("division by zero at eip {eip:#010x}")]
    DivideError { eip: u32 },

    #[error("host I/O failed behind port {port:#06x}")]
    HostIo { port: u16 },
}
