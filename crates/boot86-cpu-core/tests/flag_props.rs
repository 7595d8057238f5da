use boot86_cpu_core::{CpuMode, CpuState, Eflags};
use proptest::prelude::*;

proptest! {
    #[test]
    fn sub_flags_invariants(v1: u32, v2: u32) {
        let mut flags = Eflags::reset();
        let result = (v1 as u64).wrapping_sub(v2 as u64);
        flags.update_sub32(v1, v2, result);

        let res = v1.wrapping_sub(v2);
        prop_assert_eq!(flags.contains(Eflags::ZF), res == 0);
        prop_assert_eq!(flags.contains(Eflags::SF), res >> 31 != 0);
        prop_assert_eq!(flags.contains(Eflags::CF), v1 < v2);
        prop_assert_eq!(
            flags.contains(Eflags::PF),
            (res as u8).count_ones() % 2 == 0
        );
    }

    #[test]
    fn add_flags_invariants(v1: u32, v2: u32) {
        let mut flags = Eflags::reset();
        let result = v1 as u64 + v2 as u64;
        flags.update_add32(v1, v2, result);

        let res = v1.wrapping_add(v2);
        prop_assert_eq!(flags.contains(Eflags::ZF), res == 0);
        prop_assert_eq!(flags.contains(Eflags::SF), res >> 31 != 0);
        prop_assert_eq!(flags.contains(Eflags::CF), (v1 as u64 + v2 as u64) > u32::MAX as u64);
    }

    #[test]
    fn logic_flags_invariants(result: u32) {
        let mut flags = Eflags::reset();
        flags.insert(Eflags::CF | Eflags::OF);
        flags.update_logic32(result);

        prop_assert!(!flags.contains(Eflags::CF));
        prop_assert!(!flags.contains(Eflags::OF));
        prop_assert_eq!(flags.contains(Eflags::ZF), result == 0);
        prop_assert_eq!(flags.contains(Eflags::SF), result >> 31 != 0);
        prop_assert_eq!(
            flags.contains(Eflags::PF),
            (result as u8).count_ones() % 2 == 0
        );
    }

    #[test]
    fn byte_register_views_round_trip(idx in 0u8..8, value: u8, seed: u32) {
        let mut st = CpuState::new(CpuMode::Prot32);
        let host = if idx < 4 { idx } else { idx - 4 };
        st.set32(host, seed);

        st.set8(idx, value);

        prop_assert_eq!(st.get8(idx), value);
        let reg = st.get32(host);
        if idx < 4 {
            // Only the low byte moved.
            prop_assert_eq!(reg & 0xFFFF_FF00, seed & 0xFFFF_FF00);
            prop_assert_eq!(reg as u8, value);
        } else {
            prop_assert_eq!(reg & 0xFFFF_00FF, seed & 0xFFFF_00FF);
            prop_assert_eq!((reg >> 8) as u8, value);
        }
    }

    #[test]
    fn word_register_writes_preserve_the_upper_half(idx in 0u8..8, value: u16, seed: u32) {
        let mut st = CpuState::new(CpuMode::Prot32);
        st.set32(idx, seed);

        st.set16(idx, value);

        prop_assert_eq!(st.get16(idx), value);
        prop_assert_eq!(st.get32(idx) >> 16, seed >> 16);
    }

    #[test]
    fn greater_than_predicate_matches_its_definition(
        zf: bool, sf: bool, of: bool, cf: bool
    ) {
        let mut flags = Eflags::reset();
        flags.set(Eflags::ZF, zf);
        flags.set(Eflags::SF, sf);
        flags.set(Eflags::OF, of);
        flags.set(Eflags::CF, cf);

        // 0xF = JG, 0xE = JLE, 0x7 = JA, 0x6 = JBE.
        prop_assert_eq!(flags.condition(0xF), !zf && sf == of);
        prop_assert_eq!(flags.condition(0xE), zf || sf != of);
        prop_assert_eq!(flags.condition(0x7), !cf && !zf);
        prop_assert_eq!(flags.condition(0x6), cf || zf);
    }
}
