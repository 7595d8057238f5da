use boot86_firmware::{
    install, mp_config_table, mp_floating_pointer, EBDA_BASE, MP_CONFIG_BASE,
};
use boot86_memory::MemoryBus;

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[test]
fn floating_pointer_byte_sum_is_zero() {
    let fp = mp_floating_pointer();
    assert_eq!(&fp[0..4], b"_MP_");
    assert_eq!(byte_sum(&fp), 0);
}

#[test]
fn config_table_byte_sum_is_zero() {
    let cfg = mp_config_table();
    assert_eq!(&cfg[0..4], b"PCMP");
    assert_eq!(byte_sum(&cfg), 0);
}

#[test]
fn floating_pointer_points_at_the_config_table() {
    let fp = mp_floating_pointer();
    let ptr = u32::from_le_bytes([fp[4], fp[5], fp[6], fp[7]]);
    assert_eq!(ptr, MP_CONFIG_BASE);
    assert_eq!(fp[8], 1);
    assert_eq!(fp[9], 1);
}

#[test]
fn config_table_advertises_one_cpu_and_one_ioapic() {
    let cfg = mp_config_table();
    assert_eq!(u16::from_le_bytes([cfg[4], cfg[5]]), 72);
    assert_eq!(
        u32::from_le_bytes([cfg[36], cfg[37], cfg[38], cfg[39]]),
        0xFEC8_0000
    );
    // Processor entry.
    assert_eq!(cfg[44], 0);
    assert_eq!(cfg[45], 1);
    // IOAPIC entry.
    assert_eq!(cfg[64], 2);
    assert_eq!(cfg[65], 1);
    assert_eq!(
        u32::from_le_bytes([cfg[68], cfg[69], cfg[70], cfg[71]]),
        0xFEC0_0000
    );
}

#[test]
fn install_places_the_ebda_pointer_in_the_bda() {
    let mut mem = MemoryBus::sparse();
    install(&mut mem);
    // 0x600 >> 4 = 0x60 paragraphs.
    assert_eq!(mem.read_u8(0x040E), 0x60);
    assert_eq!(mem.read_u8(0x040F), 0x00);
    assert_eq!(mem.read_u8(EBDA_BASE), b'_');
    assert_eq!(mem.read_u8(MP_CONFIG_BASE), b'P');
}

#[test]
fn installed_tables_sum_to_zero_in_guest_memory() {
    let mut mem = MemoryBus::sparse();
    install(&mut mem);
    let mut fp = [0u8; 16];
    mem.read_physical(EBDA_BASE, &mut fp);
    assert_eq!(byte_sum(&fp), 0);
    let mut cfg = [0u8; 72];
    mem.read_physical(MP_CONFIG_BASE, &mut cfg);
    assert_eq!(byte_sum(&cfg), 0);
}
