//! Local APIC register window, diagnostics only.
//!
//! No interrupts are ever delivered; the window exists so the guest's APIC
//! bring-up writes land somewhere observable. Writes fall through to RAM
//! (the machine bus keeps normal memory semantics for the window) and the
//! interesting ones are logged here.

use tracing::debug;

pub const LAPIC_BASE: u32 = 0xFEC8_0000;

/// Spurious-interrupt vector register offset.
const REG_SVR: u32 = 0xF0;
/// LVT timer register offset.
const REG_LVT_TIMER: u32 = 0x320;

/// APIC software enable, bit 8 of the SVR.
const SVR_ENABLE: u32 = 1 << 8;
/// Periodic timer mode, bit 17 of the LVT timer entry.
const TIMER_PERIODIC: u32 = 1 << 17;

#[derive(Default)]
pub struct LocalApic;

impl LocalApic {
    pub fn new() -> Self {
        LocalApic
    }

    /// Observe a 32-bit write at `LAPIC_BASE + offset`.
    pub fn note_write(&self, offset: u32, value: u32) {
        match offset {
            REG_SVR => {
                debug!(enabled = (value & SVR_ENABLE) != 0, "lapic: svr write");
            }
            REG_LVT_TIMER => {
                debug!(
                    periodic = (value & TIMER_PERIODIC) != 0,
                    vector = value & 0xFF,
                    "lapic: timer write"
                );
            }
            _ => debug!(offset, value, "lapic: write"),
        }
    }
}
