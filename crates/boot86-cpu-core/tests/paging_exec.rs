mod util;

use boot86_cpu_core::state::EAX;
use util::{exec_one, prot32, TestBus};

/// Enable 4 MiB paging with the page directory rooted at CR3 = 0.
fn enable_paging(st: &mut boot86_cpu_core::CpuState) {
    st.cr[0] |= 1 << 31; // PG
    st.cr[3] = 0;
    st.cr[4] = 1 << 4; // PSE
}

#[test]
fn high_half_load_goes_through_the_directory_entry() {
    let mut st = prot32();
    enable_paging(&mut st);
    let mut bus = TestBus::new(0x40_0000);

    // Linear 0x8010_0000 has directory index 0x200; with a zero entry the
    // superpage offset alone selects physical 0x10_0000.
    bus.load(4 * 0x200, &[0, 0, 0, 0]);
    bus.load(0x10_0000, &[0x0D, 0xF0, 0xAD, 0x8B]);

    exec_one(&mut st, &mut bus, &[0xA1, 0x00, 0x00, 0x10, 0x80]); // mov eax, [0x80100000]

    assert_eq!(st.get32(EAX), 0x8BAD_F00D);
}

#[test]
fn nonzero_directory_entry_relocates_the_superpage() {
    let mut st = prot32();
    enable_paging(&mut st);
    let mut bus = TestBus::new(0x40_0000);

    // Directory index 0x200 maps to physical 0x20_0000; linear 0x8000_0040
    // carries superpage offset 0x40.
    bus.load(4 * 0x200, &[0x00, 0x00, 0x20, 0x00]);
    bus.load(0x20_0040, &[0x44, 0x33, 0x22, 0x11]);

    exec_one(&mut st, &mut bus, &[0xA1, 0x40, 0x00, 0x00, 0x80]); // mov eax, [0x80000040]

    assert_eq!(st.get32(EAX), 0x1122_3344);
}

#[test]
fn low_addresses_stay_identity_mapped_through_entry_zero() {
    let mut st = prot32();
    enable_paging(&mut st);
    let mut bus = TestBus::new(0x40_0000);

    // Code fetch at 0x7C00 also rides directory entry 0 (which reads zero).
    bus.load(0x1234, &[0x78, 0x56, 0x34, 0x12]);
    exec_one(&mut st, &mut bus, &[0xA1, 0x34, 0x12, 0x00, 0x00]); // mov eax, [0x1234]

    assert_eq!(st.get32(EAX), 0x1234_5678);
}

#[test]
fn stores_translate_too() {
    let mut st = prot32();
    enable_paging(&mut st);
    st.set32(EAX, 0xCAFE_BABE);
    let mut bus = TestBus::new(0x40_0000);
    bus.load(4 * 0x200, &[0, 0, 0, 0]);

    exec_one(&mut st, &mut bus, &[0xA3, 0x00, 0x00, 0x10, 0x80]); // mov [0x80100000], eax

    assert_eq!(bus.read_u32_at(0x10_0000), 0xCAFE_BABE);
}
