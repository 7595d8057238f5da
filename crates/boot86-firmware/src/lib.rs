//! Low-memory firmware structures the guest OS probes at boot.
//!
//! A multiprocessor-aware kernel locates its CPUs by scanning for the MP
//! floating pointer: first through the EBDA pointer word in the BIOS data
//! area, then in the EBDA itself, then by following the structure to the MP
//! configuration table. These tables are synthesized into guest RAM before
//! the first instruction retires so that the probe finds exactly one
//! processor and one IOAPIC.

use boot86_memory::{Backing, MemoryBus};

/// Extended BIOS data area base.
pub const EBDA_BASE: u32 = 0x600;
/// MP configuration table base.
pub const MP_CONFIG_BASE: u32 = 0x700;
/// BIOS data area word holding the EBDA segment (in paragraphs).
pub const BDA_EBDA_POINTER: u32 = 0x040E;

/// Local APIC window advertised to the guest.
pub const LAPIC_ADDR: u32 = 0xFEC8_0000;
/// IOAPIC window advertised to the guest.
pub const IOAPIC_ADDR: u32 = 0xFEC0_0000;

/// APIC id of the single advertised processor (and IOAPIC).
pub const APIC_ID: u8 = 1;

const MP_CONFIG_LEN: u16 = 72;

/// Fix up `table[at]` so the whole slice byte-sums to zero.
fn set_checksum(table: &mut [u8], at: usize) {
    table[at] = 0;
    let sum: u8 = table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    table[at] = sum.wrapping_neg();
}

/// The 16-byte `_MP_` floating pointer structure.
pub fn mp_floating_pointer() -> [u8; 16] {
    let mut fp = [0u8; 16];
    fp[0..4].copy_from_slice(b"_MP_");
    fp[4..8].copy_from_slice(&MP_CONFIG_BASE.to_le_bytes());
    fp[8] = 1; // length in paragraphs
    fp[9] = 1; // spec revision
    set_checksum(&mut fp, 10);
    fp
}

/// The 72-byte `PCMP` configuration table: header, one processor entry,
/// one IOAPIC entry.
pub fn mp_config_table() -> [u8; 72] {
    let mut cfg = [0u8; 72];
    cfg[0..4].copy_from_slice(b"PCMP");
    cfg[4..6].copy_from_slice(&MP_CONFIG_LEN.to_le_bytes());
    cfg[6] = 1; // spec revision
    cfg[36..40].copy_from_slice(&LAPIC_ADDR.to_le_bytes());

    // Processor entry.
    cfg[44] = 0; // entry type
    cfg[45] = APIC_ID;
    cfg[46] = 1; // APIC version

    // IOAPIC entry.
    cfg[64] = 2; // entry type
    cfg[65] = APIC_ID;
    cfg[66] = 1; // APIC version
    cfg[68..72].copy_from_slice(&IOAPIC_ADDR.to_le_bytes());

    set_checksum(&mut cfg, 7);
    cfg
}

/// Write the EBDA pointer, floating pointer, and config table into RAM.
pub fn install<B: Backing>(mem: &mut MemoryBus<B>) {
    mem.write_u8(BDA_EBDA_POINTER, ((EBDA_BASE >> 4) & 0xFF) as u8);
    mem.write_u8(BDA_EBDA_POINTER + 1, ((EBDA_BASE >> 12) & 0xFF) as u8);
    mem.write_physical(EBDA_BASE, &mp_floating_pointer());
    mem.write_physical(MP_CONFIG_BASE, &mp_config_table());
}
