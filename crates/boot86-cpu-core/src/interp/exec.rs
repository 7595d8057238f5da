//! One-instruction-at-a-time executor.
//!
//! [`step`] fetches at EIP through the address translator, folds in the
//! 0x66 operand-size and 0xF3 REP prefixes, and dispatches through a
//! one-byte opcode match with secondary matches for the 0x0F map and the
//! ModR/M-reg-keyed immediate groups. The effective operand size also
//! selects the effective-address form: 32-bit decoding uses ModR/M+SIB,
//! 16-bit decoding uses the register-pair rows. The 0x66 prefix inverts
//! both for exactly one instruction.

use boot86_mmu::PagingConfig;
use tracing::{debug, warn};

use crate::bus::CpuBus;
use crate::decode::{ModRm, RawModRm, RmOperand, Sib};
use crate::flags::Eflags;
use crate::state::{CpuMode, CpuState, TableRegister, CS, EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP};
use crate::Exception;

/// How an instruction retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// Fell through to the next instruction.
    Continue,
    /// Took a control transfer; EIP is the new target.
    Branch,
    /// Executed HLT. The machine has nothing further to run.
    Halted,
}

/// Execute exactly one instruction (prefixes included).
pub fn step<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<StepExit, Exception> {
    let start = state.eip;
    let wide = state.mode() == CpuMode::Prot32;
    let mut exec = Exec {
        st: state,
        bus,
        wide,
        start,
    };
    exec.run()
}

/// The two-operand ALU families that share encodings and flag handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    /// Group 80/81/83 sub-opcode selection.
    fn from_group_ext(ext: u8) -> Option<Alu> {
        match ext {
            0 => Some(Alu::Add),
            1 => Some(Alu::Or),
            4 => Some(Alu::And),
            5 => Some(Alu::Sub),
            7 => Some(Alu::Cmp),
            _ => None,
        }
    }
}

struct Exec<'a, B: CpuBus> {
    st: &'a mut CpuState,
    bus: &'a mut B,
    /// Effective 32-bit operand/address size for this instruction.
    wide: bool,
    /// EIP at the start of the instruction, for diagnostics.
    start: u32,
}

impl<'a, B: CpuBus> Exec<'a, B> {
    fn run(&mut self) -> Result<StepExit, Exception> {
        let mut rep = false;
        let opcode = loop {
            match self.fetch8()? {
                0x66 => self.wide = !self.wide,
                0xF3 => rep = true,
                other => break other,
            }
        };
        if rep && matches!(opcode, 0xAA | 0xAB | 0x6D) {
            return self.rep_string(opcode);
        }
        self.dispatch(opcode)
    }

    // ------------------------------------------------------------------
    // Address translation and memory access (linear addresses)
    // ------------------------------------------------------------------

    fn v2p(&mut self, lin: u32) -> Result<u32, Exception> {
        let cfg = PagingConfig::from_control(self.st.cr[0], self.st.cr[3], self.st.cr[4]);
        if !cfg.enabled {
            return Ok(lin);
        }
        let entry = self.bus.read_u32(cfg.pde_addr(lin))?;
        Ok(cfg.apply(entry, lin))
    }

    fn load8(&mut self, lin: u32) -> Result<u8, Exception> {
        let p = self.v2p(lin)?;
        self.bus.read_u8(p)
    }

    fn load16(&mut self, lin: u32) -> Result<u16, Exception> {
        let p = self.v2p(lin)?;
        self.bus.read_u16(p)
    }

    fn load32(&mut self, lin: u32) -> Result<u32, Exception> {
        let p = self.v2p(lin)?;
        self.bus.read_u32(p)
    }

    fn load64(&mut self, lin: u32) -> Result<u64, Exception> {
        let p = self.v2p(lin)?;
        self.bus.read_u64(p)
    }

    fn store8(&mut self, lin: u32, value: u8) -> Result<(), Exception> {
        let p = self.v2p(lin)?;
        self.bus.write_u8(p, value)
    }

    fn store16(&mut self, lin: u32, value: u16) -> Result<(), Exception> {
        let p = self.v2p(lin)?;
        self.bus.write_u16(p, value)
    }

    fn store32(&mut self, lin: u32, value: u32) -> Result<(), Exception> {
        let p = self.v2p(lin)?;
        self.bus.write_u32(p, value)
    }

    // ------------------------------------------------------------------
    // Instruction-stream fetch
    // ------------------------------------------------------------------

    fn fetch8(&mut self) -> Result<u8, Exception> {
        let b = self.load8(self.st.eip)?;
        self.st.eip = self.st.eip.wrapping_add(1);
        Ok(b)
    }

    fn fetch16(&mut self) -> Result<u16, Exception> {
        let w = self.load16(self.st.eip)?;
        self.st.eip = self.st.eip.wrapping_add(2);
        Ok(w)
    }

    fn fetch32(&mut self) -> Result<u32, Exception> {
        let d = self.load32(self.st.eip)?;
        self.st.eip = self.st.eip.wrapping_add(4);
        Ok(d)
    }

    /// Immediate of the effective operand size, zero-extended.
    fn fetch_imm(&mut self) -> Result<u32, Exception> {
        if self.wide {
            self.fetch32()
        } else {
            Ok(self.fetch16()? as u32)
        }
    }

    /// Branch displacement of the effective operand size, sign-extended.
    fn fetch_rel(&mut self) -> Result<i32, Exception> {
        if self.wide {
            Ok(self.fetch32()? as i32)
        } else {
            Ok(self.fetch16()? as i16 as i32)
        }
    }

    // ------------------------------------------------------------------
    // ModR/M decoding
    // ------------------------------------------------------------------

    fn parse_modrm(&mut self) -> Result<ModRm, Exception> {
        let raw = RawModRm::from_byte(self.fetch8()?);
        if raw.md == 3 {
            return Ok(ModRm {
                reg: raw.reg,
                operand: RmOperand::Reg(raw.rm),
            });
        }
        let addr = if self.wide {
            self.ea32(raw)?
        } else {
            self.ea16(raw)?
        };
        Ok(ModRm {
            reg: raw.reg,
            operand: RmOperand::Mem(addr),
        })
    }

    /// 16-bit effective address: register-pair row plus displacement,
    /// wrapping within the 64 KiB segment (bases are zero).
    fn ea16(&mut self, m: RawModRm) -> Result<u32, Exception> {
        fn row(st: &CpuState, rm: u8) -> u32 {
            let r = |idx: u8| st.get16(idx) as u32;
            match rm {
                0 => r(EBX).wrapping_add(r(ESI)),
                1 => r(EBX).wrapping_add(r(EDI)),
                2 => r(EBP).wrapping_add(r(ESI)),
                3 => r(EBP).wrapping_add(r(EDI)),
                4 => r(ESI),
                5 => r(EDI),
                6 => r(EBP),
                _ => r(EBX),
            }
        }
        let ea = match m.md {
            0 => {
                if m.rm == 6 {
                    self.fetch16()? as u32
                } else {
                    row(self.st, m.rm)
                }
            }
            1 => {
                let disp = self.fetch8()? as i8 as i32;
                row(self.st, m.rm).wrapping_add(disp as u32)
            }
            _ => {
                let disp = self.fetch16()? as i16 as i32;
                row(self.st, m.rm).wrapping_add(disp as u32)
            }
        };
        Ok(ea & 0xFFFF)
    }

    /// 32-bit effective address with the SIB forms.
    fn ea32(&mut self, m: RawModRm) -> Result<u32, Exception> {
        if m.rm == 4 {
            let sib = Sib::from_byte(self.fetch8()?);
            let base = if m.md == 0 && sib.base == 5 {
                self.fetch32()?
            } else {
                self.st.get32(sib.base)
            };
            let index = if sib.index != 4 {
                self.st.get32(sib.index) << sib.scale
            } else {
                0
            };
            let disp = match m.md {
                0 => 0,
                1 => self.fetch8()? as i8 as i32 as u32,
                _ => self.fetch32()?,
            };
            return Ok(base.wrapping_add(index).wrapping_add(disp));
        }
        match m.md {
            0 if m.rm == 5 => self.fetch32(),
            0 => Ok(self.st.get32(m.rm)),
            1 => {
                let disp = self.fetch8()? as i8 as i32 as u32;
                Ok(self.st.get32(m.rm).wrapping_add(disp))
            }
            _ => {
                let disp = self.fetch32()?;
                Ok(self.st.get32(m.rm).wrapping_add(disp))
            }
        }
    }

    // ------------------------------------------------------------------
    // Operand access at the effective width
    // ------------------------------------------------------------------

    fn read_reg(&self, idx: u8) -> u32 {
        if self.wide {
            self.st.get32(idx)
        } else {
            self.st.get16(idx) as u32
        }
    }

    fn write_reg(&mut self, idx: u8, value: u32) {
        if self.wide {
            self.st.set32(idx, value);
        } else {
            self.st.set16(idx, value as u16);
        }
    }

    fn read_rm(&mut self, rm: RmOperand) -> Result<u32, Exception> {
        match rm {
            RmOperand::Reg(r) => Ok(self.read_reg(r)),
            RmOperand::Mem(addr) => {
                if self.wide {
                    self.load32(addr)
                } else {
                    Ok(self.load16(addr)? as u32)
                }
            }
        }
    }

    fn write_rm(&mut self, rm: RmOperand, value: u32) -> Result<(), Exception> {
        match rm {
            RmOperand::Reg(r) => {
                self.write_reg(r, value);
                Ok(())
            }
            RmOperand::Mem(addr) => {
                if self.wide {
                    self.store32(addr, value)
                } else {
                    self.store16(addr, value as u16)
                }
            }
        }
    }

    fn read_rm8(&mut self, rm: RmOperand) -> Result<u8, Exception> {
        match rm {
            RmOperand::Reg(r) => Ok(self.st.get8(r)),
            RmOperand::Mem(addr) => self.load8(addr),
        }
    }

    fn write_rm8(&mut self, rm: RmOperand, value: u8) -> Result<(), Exception> {
        match rm {
            RmOperand::Reg(r) => {
                self.st.set8(r, value);
                Ok(())
            }
            RmOperand::Mem(addr) => self.store8(addr, value),
        }
    }

    fn read_rm16(&mut self, rm: RmOperand) -> Result<u16, Exception> {
        match rm {
            RmOperand::Reg(r) => Ok(self.st.get16(r)),
            RmOperand::Mem(addr) => self.load16(addr),
        }
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    fn push(&mut self, value: u32) -> Result<(), Exception> {
        if self.wide {
            let sp = self.st.get32(ESP).wrapping_sub(4);
            self.store32(sp, value)?;
            self.st.set32(ESP, sp);
        } else {
            let sp = self.st.get32(ESP).wrapping_sub(2);
            self.store16(sp, value as u16)?;
            self.st.set32(ESP, sp);
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<u32, Exception> {
        let sp = self.st.get32(ESP);
        if self.wide {
            let value = self.load32(sp)?;
            self.st.set32(ESP, sp.wrapping_add(4));
            Ok(value)
        } else {
            let value = self.load16(sp)? as u32;
            self.st.set32(ESP, sp.wrapping_add(2));
            Ok(value)
        }
    }

    // ------------------------------------------------------------------
    // ALU
    // ------------------------------------------------------------------

    /// Apply a two-operand ALU family at the effective width. Returns the
    /// result and whether it is written back (CMP only sets flags).
    fn alu(&mut self, op: Alu, a: u32, b: u32) -> (u32, bool) {
        if self.wide {
            match op {
                Alu::Add => {
                    let wide = a as u64 + b as u64;
                    self.st.eflags.update_add32(a, b, wide);
                    (wide as u32, true)
                }
                Alu::Sub | Alu::Cmp => {
                    let wide = (a as u64).wrapping_sub(b as u64);
                    self.st.eflags.update_sub32(a, b, wide);
                    (wide as u32, op == Alu::Sub)
                }
                Alu::Or => {
                    let r = a | b;
                    self.st.eflags.update_logic32(r);
                    (r, true)
                }
                Alu::And => {
                    let r = a & b;
                    self.st.eflags.update_logic32(r);
                    (r, true)
                }
                Alu::Xor => {
                    let r = a ^ b;
                    self.st.eflags.update_logic32(r);
                    (r, true)
                }
            }
        } else {
            let a = a as u16;
            let b = b as u16;
            match op {
                Alu::Add => {
                    let wide = a as u32 + b as u32;
                    self.st.eflags.update_add16(a, b, wide);
                    (wide as u16 as u32, true)
                }
                Alu::Sub | Alu::Cmp => {
                    let wide = (a as u32).wrapping_sub(b as u32);
                    self.st.eflags.update_sub16(a, b, wide);
                    (wide as u16 as u32, op == Alu::Sub)
                }
                Alu::Or => {
                    let r = a | b;
                    self.st.eflags.update_logic16(r);
                    (r as u32, true)
                }
                Alu::And => {
                    let r = a & b;
                    self.st.eflags.update_logic16(r);
                    (r as u32, true)
                }
                Alu::Xor => {
                    let r = a ^ b;
                    self.st.eflags.update_logic16(r);
                    (r as u32, true)
                }
            }
        }
    }

    /// 8-bit variant of [`Self::alu`].
    fn alu8(&mut self, op: Alu, a: u8, b: u8) -> (u8, bool) {
        match op {
            Alu::Add => {
                let wide = a as u16 + b as u16;
                self.st.eflags.update_add8(a, b, wide);
                (wide as u8, true)
            }
            Alu::Sub | Alu::Cmp => {
                let wide = (a as u16).wrapping_sub(b as u16);
                self.st.eflags.update_sub8(a, b, wide);
                (wide as u8, op == Alu::Sub)
            }
            Alu::Or => {
                let r = a | b;
                self.st.eflags.update_logic8(r);
                (r, true)
            }
            Alu::And => {
                let r = a & b;
                self.st.eflags.update_logic8(r);
                (r, true)
            }
            Alu::Xor => {
                let r = a ^ b;
                self.st.eflags.update_logic8(r);
                (r, true)
            }
        }
    }

    fn alu_rm_r(&mut self, op: Alu) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let a = self.read_rm(m.operand)?;
        let b = self.read_reg(m.reg);
        let (r, write) = self.alu(op, a, b);
        if write {
            self.write_rm(m.operand, r)?;
        }
        Ok(())
    }

    fn alu_r_rm(&mut self, op: Alu) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let a = self.read_reg(m.reg);
        let b = self.read_rm(m.operand)?;
        let (r, write) = self.alu(op, a, b);
        if write {
            self.write_reg(m.reg, r);
        }
        Ok(())
    }

    fn alu_rm_r8(&mut self, op: Alu) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let a = self.read_rm8(m.operand)?;
        let b = self.st.get8(m.reg);
        let (r, write) = self.alu8(op, a, b);
        if write {
            self.write_rm8(m.operand, r)?;
        }
        Ok(())
    }

    fn alu_r_rm8(&mut self, op: Alu) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let a = self.st.get8(m.reg);
        let b = self.read_rm8(m.operand)?;
        let (r, write) = self.alu8(op, a, b);
        if write {
            self.st.set8(m.reg, r);
        }
        Ok(())
    }

    /// Accumulator-immediate form at the effective width.
    fn alu_acc_imm(&mut self, op: Alu) -> Result<(), Exception> {
        let imm = self.fetch_imm()?;
        let a = self.read_reg(EAX);
        let (r, write) = self.alu(op, a, imm);
        if write {
            self.write_reg(EAX, r);
        }
        Ok(())
    }

    /// AL-immediate form.
    fn alu_acc_imm8(&mut self, op: Alu) -> Result<(), Exception> {
        let imm = self.fetch8()?;
        let a = self.st.get8(0);
        let (r, write) = self.alu8(op, a, imm);
        if write {
            self.st.set8(0, r);
        }
        Ok(())
    }

    fn test(&mut self, a: u32, b: u32) {
        if self.wide {
            self.st.eflags.update_logic32(a & b);
        } else {
            self.st.eflags.update_logic16((a & b) as u16);
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    fn jcc_rel8(&mut self, cc: u8) -> Result<StepExit, Exception> {
        let disp = self.fetch8()? as i8 as i32;
        if self.st.eflags.condition(cc) {
            self.st.eip = self.st.eip.wrapping_add(disp as u32);
            Ok(StepExit::Branch)
        } else {
            Ok(StepExit::Continue)
        }
    }

    fn jcc_rel(&mut self, cc: u8) -> Result<StepExit, Exception> {
        let disp = self.fetch_rel()?;
        if self.st.eflags.condition(cc) {
            self.st.eip = self.st.eip.wrapping_add(disp as u32);
            Ok(StepExit::Branch)
        } else {
            Ok(StepExit::Continue)
        }
    }

    // ------------------------------------------------------------------
    // String operations
    // ------------------------------------------------------------------

    fn rep_string(&mut self, opcode: u8) -> Result<StepExit, Exception> {
        loop {
            let count = if self.wide {
                self.st.get32(ECX)
            } else {
                self.st.get16(ECX) as u32
            };
            if count == 0 {
                break;
            }
            self.string_op(opcode)?;
            if self.wide {
                self.st.set32(ECX, count - 1);
            } else {
                self.st.set16(ECX, (count - 1) as u16);
            }
        }
        Ok(StepExit::Continue)
    }

    fn string_op(&mut self, opcode: u8) -> Result<(), Exception> {
        let di = if self.wide {
            self.st.get32(EDI)
        } else {
            self.st.get16(EDI) as u32
        };
        match opcode {
            0xAA => {
                let al = self.st.get8(0);
                self.store8(di, al)?;
                self.bump_index(EDI, 1);
            }
            0xAB => {
                if self.wide {
                    let eax = self.st.get32(EAX);
                    self.store32(di, eax)?;
                    self.bump_index(EDI, 4);
                } else {
                    let ax = self.st.get16(EAX);
                    self.store16(di, ax)?;
                    self.bump_index(EDI, 2);
                }
            }
            0x6D => {
                let port = self.st.get16(EDX);
                if self.wide {
                    let value = self.bus.io_read(port, 4)?;
                    self.store32(di, value)?;
                    self.bump_index(EDI, 4);
                } else {
                    let value = self.bus.io_read(port, 2)?;
                    self.store16(di, value as u16)?;
                    self.bump_index(EDI, 2);
                }
            }
            _ => unreachable!("not a string opcode: {opcode:#04x}"),
        }
        Ok(())
    }

    /// Advance an index register by `delta`, direction per DF.
    fn bump_index(&mut self, idx: u8, delta: u32) {
        let down = self.st.eflags.contains(Eflags::DF);
        if self.wide {
            let v = self.st.get32(idx);
            self.st.set32(
                idx,
                if down {
                    v.wrapping_sub(delta)
                } else {
                    v.wrapping_add(delta)
                },
            );
        } else {
            let v = self.st.get16(idx);
            self.st.set16(
                idx,
                if down {
                    v.wrapping_sub(delta as u16)
                } else {
                    v.wrapping_add(delta as u16)
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Groups 80/81/83: immediate ALU against r/m.
    fn group_imm(&mut self, opcode: u8) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let Some(op) = Alu::from_group_ext(m.reg) else {
            return Err(Exception::UndefinedGroupOp {
                eip: self.start,
                opcode,
                ext: m.reg,
            });
        };
        match opcode {
            0x80 => {
                let a = self.read_rm8(m.operand)?;
                let imm = self.fetch8()?;
                let (r, write) = self.alu8(op, a, imm);
                if write {
                    self.write_rm8(m.operand, r)?;
                }
            }
            0x81 => {
                let a = self.read_rm(m.operand)?;
                let imm = self.fetch_imm()?;
                let (r, write) = self.alu(op, a, imm);
                if write {
                    self.write_rm(m.operand, r)?;
                }
            }
            _ => {
                // 0x83: byte immediate sign-extended to the operand width.
                let a = self.read_rm(m.operand)?;
                let imm = self.fetch8()? as i8 as i32 as u32;
                let (r, write) = self.alu(op, a, imm);
                if write {
                    self.write_rm(m.operand, r)?;
                }
            }
        }
        Ok(())
    }

    /// Group C1: shift r/m by an immediate count.
    fn group_shift(&mut self) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let count = (self.fetch8()? & 0x1F) as u32;
        if count == 0 {
            return Ok(());
        }
        let width: u32 = if self.wide { 32 } else { 16 };
        let v = self.read_rm(m.operand)?;
        let (result, carry) = match m.reg {
            4 => {
                // SHL
                let full = (v as u64) << count;
                (full as u32, (full >> width) & 1 != 0)
            }
            5 => {
                // SHR; the operand is already masked to the width, so large
                // counts shift everything out naturally.
                let carry = (v >> (count - 1)) & 1 != 0;
                (v >> count, carry)
            }
            7 => {
                // SAR keeps the sign bit.
                let sv: i64 = if self.wide {
                    v as i32 as i64
                } else {
                    v as u16 as i16 as i64
                };
                let carry = (sv >> (count - 1)) & 1 != 0;
                ((sv >> count.min(63)) as u32, carry)
            }
            ext => {
                return Err(Exception::UndefinedGroupOp {
                    eip: self.start,
                    opcode: 0xC1,
                    ext,
                })
            }
        };
        let result = if self.wide { result } else { result & 0xFFFF };
        if self.wide {
            self.st.eflags.update_logic32(result);
        } else {
            self.st.eflags.update_logic16(result as u16);
        }
        self.st.eflags.set(Eflags::CF, carry);
        self.write_rm(m.operand, result)
    }

    /// Group F7 (and F6 for bytes): TEST/NEG/DIV.
    fn group_unary(&mut self, opcode: u8) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        match (opcode, m.reg) {
            (0xF6, 0) => {
                let a = self.read_rm8(m.operand)?;
                let imm = self.fetch8()?;
                self.st.eflags.update_logic8(a & imm);
            }
            (0xF7, 0) => {
                let a = self.read_rm(m.operand)?;
                let imm = self.fetch_imm()?;
                self.test(a, imm);
            }
            (0xF6, 3) => {
                let v = self.read_rm8(m.operand)?;
                let wide = 0u16.wrapping_sub(v as u16);
                self.st.eflags.update_sub8(0, v, wide);
                self.write_rm8(m.operand, wide as u8)?;
            }
            (0xF7, 3) => {
                let v = self.read_rm(m.operand)?;
                if self.wide {
                    let wide = 0u64.wrapping_sub(v as u64);
                    self.st.eflags.update_sub32(0, v, wide);
                    self.write_rm(m.operand, wide as u32)?;
                } else {
                    let wide = 0u32.wrapping_sub(v);
                    self.st.eflags.update_sub16(0, v as u16, wide);
                    self.write_rm(m.operand, wide as u16 as u32)?;
                }
            }
            (0xF6, 6) => {
                let divisor = self.read_rm8(m.operand)? as u16;
                if divisor == 0 {
                    return Err(Exception::DivideError { eip: self.start });
                }
                let dividend = self.st.get16(EAX);
                self.st.set8(0, (dividend / divisor) as u8); // AL
                self.st.set8(4, (dividend % divisor) as u8); // AH
            }
            (0xF7, 6) => {
                let divisor = self.read_rm(m.operand)?;
                if divisor == 0 {
                    return Err(Exception::DivideError { eip: self.start });
                }
                if self.wide {
                    let dividend =
                        ((self.st.get32(EDX) as u64) << 32) | self.st.get32(EAX) as u64;
                    self.st.set32(EAX, (dividend / divisor as u64) as u32);
                    self.st.set32(EDX, (dividend % divisor as u64) as u32);
                } else {
                    let dividend =
                        ((self.st.get16(EDX) as u32) << 16) | self.st.get16(EAX) as u32;
                    self.st.set16(EAX, (dividend / divisor) as u16);
                    self.st.set16(EDX, (dividend % divisor) as u16);
                }
            }
            (_, ext) => {
                return Err(Exception::UndefinedGroupOp {
                    eip: self.start,
                    opcode,
                    ext,
                })
            }
        }
        Ok(())
    }

    /// Group FF: INC/DEC/CALL/JMP/PUSH on r/m.
    fn group_ff(&mut self) -> Result<StepExit, Exception> {
        let m = self.parse_modrm()?;
        match m.reg {
            0 => {
                let old = self.read_rm(m.operand)?;
                let result = old.wrapping_add(1);
                self.write_rm(m.operand, result)?;
                self.st.eflags.update_inc(old, result, self.wide);
                Ok(StepExit::Continue)
            }
            1 => {
                let old = self.read_rm(m.operand)?;
                let result = old.wrapping_sub(1);
                self.write_rm(m.operand, result)?;
                self.st.eflags.update_dec(old, result, self.wide);
                Ok(StepExit::Continue)
            }
            2 => {
                let target = self.read_rm(m.operand)?;
                let ret = self.st.eip;
                self.push(ret)?;
                self.st.eip = target;
                Ok(StepExit::Branch)
            }
            4 => {
                self.st.eip = self.read_rm(m.operand)?;
                Ok(StepExit::Branch)
            }
            6 => {
                let value = self.read_rm(m.operand)?;
                self.push(value)?;
                Ok(StepExit::Continue)
            }
            ext => Err(Exception::UndefinedGroupOp {
                eip: self.start,
                opcode: 0xFF,
                ext,
            }),
        }
    }

    // ------------------------------------------------------------------
    // The 0x0F map
    // ------------------------------------------------------------------

    fn dispatch_0f(&mut self) -> Result<StepExit, Exception> {
        let opcode = self.fetch8()?;
        match opcode {
            0x01 => {
                let m = self.parse_modrm()?;
                let RmOperand::Mem(addr) = m.operand else {
                    return Err(Exception::UndefinedGroupOp {
                        eip: self.start,
                        opcode: 0x01,
                        ext: m.reg,
                    });
                };
                let limit = self.load16(addr)?;
                let base = self.load32(addr.wrapping_add(2))?;
                let table = TableRegister { base, limit };
                match m.reg {
                    2 => {
                        self.st.gdtr = table;
                        self.dump_descriptors("gdt", table)?;
                    }
                    3 => {
                        self.st.idtr = table;
                        self.dump_descriptors("idt", table)?;
                    }
                    ext => {
                        return Err(Exception::UndefinedGroupOp {
                            eip: self.start,
                            opcode: 0x01,
                            ext,
                        })
                    }
                }
                Ok(StepExit::Continue)
            }
            0x20 => {
                // MOV r32, CRn — always full 32-bit, mod ignored.
                let raw = RawModRm::from_byte(self.fetch8()?);
                let value = self.st.get_cr(raw.reg);
                self.st.set32(raw.rm, value);
                Ok(StepExit::Continue)
            }
            0x22 => {
                let raw = RawModRm::from_byte(self.fetch8()?);
                let value = self.st.get32(raw.rm);
                match raw.reg {
                    0 => debug!(pe = value & 1 != 0, value, "cr0 write"),
                    3 => debug!(page_directory = value, "cr3 write"),
                    4 => debug!(pse = value & (1 << 4) != 0, value, "cr4 write"),
                    _ => debug!(register = raw.reg, value, "control register write"),
                }
                self.st.set_cr(raw.reg, value);
                Ok(StepExit::Continue)
            }
            0x80..=0x8F => self.jcc_rel(opcode & 0x0F),
            0xB6 => {
                let m = self.parse_modrm()?;
                let v = self.read_rm8(m.operand)?;
                self.write_reg(m.reg, v as u32);
                Ok(StepExit::Continue)
            }
            0xB7 => {
                let m = self.parse_modrm()?;
                let v = self.read_rm16(m.operand)?;
                self.st.set32(m.reg, v as u32);
                Ok(StepExit::Continue)
            }
            0xBE => {
                let m = self.parse_modrm()?;
                let v = self.read_rm8(m.operand)? as i8 as i32 as u32;
                self.write_reg(m.reg, v);
                Ok(StepExit::Continue)
            }
            0xBF => {
                let m = self.parse_modrm()?;
                let v = self.read_rm16(m.operand)? as i16 as i32 as u32;
                self.st.set32(m.reg, v);
                Ok(StepExit::Continue)
            }
            _ => Err(Exception::UndefinedTwoByteOpcode {
                eip: self.start,
                opcode,
            }),
        }
    }

    /// Log every descriptor in a freshly loaded table.
    fn dump_descriptors(&mut self, which: &str, table: TableRegister) -> Result<(), Exception> {
        let entries = (table.limit as u32 + 1) / 8;
        debug!(
            base = %format_args!("{:#010x}", table.base),
            limit = table.limit,
            entries,
            "{which} loaded"
        );
        for i in 0..entries {
            let raw = self.load64(table.base.wrapping_add(i * 8))?;
            debug!(index = i, descriptor = %format_args!("{raw:#018x}"), "{which} entry");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Primary dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, opcode: u8) -> Result<StepExit, Exception> {
        match opcode {
            // ADD
            0x00 => self.alu_rm_r8(Alu::Add).map(|_| StepExit::Continue),
            0x01 => self.alu_rm_r(Alu::Add).map(|_| StepExit::Continue),
            0x02 => self.alu_r_rm8(Alu::Add).map(|_| StepExit::Continue),
            0x03 => self.alu_r_rm(Alu::Add).map(|_| StepExit::Continue),
            0x04 => self.alu_acc_imm8(Alu::Add).map(|_| StepExit::Continue),
            0x05 => self.alu_acc_imm(Alu::Add).map(|_| StepExit::Continue),

            // OR
            0x08 => self.alu_rm_r8(Alu::Or).map(|_| StepExit::Continue),
            0x09 => self.alu_rm_r(Alu::Or).map(|_| StepExit::Continue),
            0x0A => self.alu_r_rm8(Alu::Or).map(|_| StepExit::Continue),
            0x0B => self.alu_r_rm(Alu::Or).map(|_| StepExit::Continue),
            0x0C => self.alu_acc_imm8(Alu::Or).map(|_| StepExit::Continue),
            0x0D => self.alu_acc_imm(Alu::Or).map(|_| StepExit::Continue),

            0x0F => self.dispatch_0f(),

            // AND
            0x20 => self.alu_rm_r8(Alu::And).map(|_| StepExit::Continue),
            0x21 => self.alu_rm_r(Alu::And).map(|_| StepExit::Continue),
            0x22 => self.alu_r_rm8(Alu::And).map(|_| StepExit::Continue),
            0x23 => self.alu_r_rm(Alu::And).map(|_| StepExit::Continue),
            0x24 => self.alu_acc_imm8(Alu::And).map(|_| StepExit::Continue),
            0x25 => self.alu_acc_imm(Alu::And).map(|_| StepExit::Continue),

            // SUB
            0x28 => self.alu_rm_r8(Alu::Sub).map(|_| StepExit::Continue),
            0x29 => self.alu_rm_r(Alu::Sub).map(|_| StepExit::Continue),
            0x2A => self.alu_r_rm8(Alu::Sub).map(|_| StepExit::Continue),
            0x2B => self.alu_r_rm(Alu::Sub).map(|_| StepExit::Continue),
            0x2C => self.alu_acc_imm8(Alu::Sub).map(|_| StepExit::Continue),
            0x2D => self.alu_acc_imm(Alu::Sub).map(|_| StepExit::Continue),

            // XOR
            0x30 => self.alu_rm_r8(Alu::Xor).map(|_| StepExit::Continue),
            0x31 => self.alu_rm_r(Alu::Xor).map(|_| StepExit::Continue),
            0x32 => self.alu_r_rm8(Alu::Xor).map(|_| StepExit::Continue),
            0x33 => self.alu_r_rm(Alu::Xor).map(|_| StepExit::Continue),
            0x34 => self.alu_acc_imm8(Alu::Xor).map(|_| StepExit::Continue),
            0x35 => self.alu_acc_imm(Alu::Xor).map(|_| StepExit::Continue),

            // CMP
            0x38 => self.alu_rm_r8(Alu::Cmp).map(|_| StepExit::Continue),
            0x39 => self.alu_rm_r(Alu::Cmp).map(|_| StepExit::Continue),
            0x3A => self.alu_r_rm8(Alu::Cmp).map(|_| StepExit::Continue),
            0x3B => self.alu_r_rm(Alu::Cmp).map(|_| StepExit::Continue),
            0x3C => self.alu_acc_imm8(Alu::Cmp).map(|_| StepExit::Continue),
            0x3D => self.alu_acc_imm(Alu::Cmp).map(|_| StepExit::Continue),

            // INC/DEC r
            0x40..=0x47 => {
                let reg = opcode - 0x40;
                let old = self.read_reg(reg);
                let result = old.wrapping_add(1);
                self.write_reg(reg, result);
                self.st.eflags.update_inc(old, result, self.wide);
                Ok(StepExit::Continue)
            }
            0x48..=0x4F => {
                let reg = opcode - 0x48;
                let old = self.read_reg(reg);
                let result = old.wrapping_sub(1);
                self.write_reg(reg, result);
                self.st.eflags.update_dec(old, result, self.wide);
                Ok(StepExit::Continue)
            }

            // PUSH/POP r
            0x50..=0x57 => {
                let value = self.read_reg(opcode - 0x50);
                self.push(value)?;
                Ok(StepExit::Continue)
            }
            0x58..=0x5F => {
                let value = self.pop()?;
                self.write_reg(opcode - 0x58, value);
                Ok(StepExit::Continue)
            }

            0x68 => {
                let imm = self.fetch_imm()?;
                self.push(imm)?;
                Ok(StepExit::Continue)
            }
            0x69 => self.imul_imm(false).map(|_| StepExit::Continue),
            0x6A => {
                let imm = self.fetch8()? as i8 as i32 as u32;
                self.push(imm)?;
                Ok(StepExit::Continue)
            }
            0x6B => self.imul_imm(true).map(|_| StepExit::Continue),
            0x6D => self.string_op(0x6D).map(|_| StepExit::Continue),

            0x70..=0x7F => self.jcc_rel8(opcode & 0x0F),

            0x80 | 0x81 | 0x83 => self.group_imm(opcode).map(|_| StepExit::Continue),

            // TEST
            0x84 => {
                let m = self.parse_modrm()?;
                let a = self.read_rm8(m.operand)?;
                let b = self.st.get8(m.reg);
                self.st.eflags.update_logic8(a & b);
                Ok(StepExit::Continue)
            }
            0x85 => {
                let m = self.parse_modrm()?;
                let a = self.read_rm(m.operand)?;
                let b = self.read_reg(m.reg);
                self.test(a, b);
                Ok(StepExit::Continue)
            }

            // MOV r/m <-> r
            0x88 => {
                let m = self.parse_modrm()?;
                let v = self.st.get8(m.reg);
                self.write_rm8(m.operand, v)?;
                Ok(StepExit::Continue)
            }
            0x89 => {
                let m = self.parse_modrm()?;
                let v = self.read_reg(m.reg);
                self.write_rm(m.operand, v)?;
                Ok(StepExit::Continue)
            }
            0x8A => {
                let m = self.parse_modrm()?;
                let v = self.read_rm8(m.operand)?;
                self.st.set8(m.reg, v);
                Ok(StepExit::Continue)
            }
            0x8B => {
                let m = self.parse_modrm()?;
                let v = self.read_rm(m.operand)?;
                self.write_reg(m.reg, v);
                Ok(StepExit::Continue)
            }
            0x8D => {
                let m = self.parse_modrm()?;
                let RmOperand::Mem(addr) = m.operand else {
                    return Err(Exception::UndefinedOpcode {
                        eip: self.start,
                        opcode,
                    });
                };
                self.write_reg(m.reg, addr);
                Ok(StepExit::Continue)
            }
            0x8E => {
                let m = self.parse_modrm()?;
                if m.reg > 5 {
                    return Err(Exception::UndefinedGroupOp {
                        eip: self.start,
                        opcode,
                        ext: m.reg,
                    });
                }
                let v = self.read_rm16(m.operand)?;
                self.st.set_sreg(m.reg, v);
                Ok(StepExit::Continue)
            }

            0x90 => Ok(StepExit::Continue),

            0x9C => {
                let flags = self.st.eflags.bits();
                self.push(flags)?;
                Ok(StepExit::Continue)
            }

            // MOV accumulator <-> moffs
            0xA0 => {
                let addr = self.fetch_moffs()?;
                let v = self.load8(addr)?;
                self.st.set8(0, v);
                Ok(StepExit::Continue)
            }
            0xA1 => {
                let addr = self.fetch_moffs()?;
                if self.wide {
                    let v = self.load32(addr)?;
                    self.st.set32(EAX, v);
                } else {
                    let v = self.load16(addr)?;
                    self.st.set16(EAX, v);
                }
                Ok(StepExit::Continue)
            }
            0xA2 => {
                let addr = self.fetch_moffs()?;
                let v = self.st.get8(0);
                self.store8(addr, v)?;
                Ok(StepExit::Continue)
            }
            0xA3 => {
                let addr = self.fetch_moffs()?;
                if self.wide {
                    let v = self.st.get32(EAX);
                    self.store32(addr, v)?;
                } else {
                    let v = self.st.get16(EAX);
                    self.store16(addr, v)?;
                }
                Ok(StepExit::Continue)
            }

            // TEST accumulator, imm
            0xA8 => {
                let imm = self.fetch8()?;
                let al = self.st.get8(0);
                self.st.eflags.update_logic8(al & imm);
                Ok(StepExit::Continue)
            }
            0xA9 => {
                let imm = self.fetch_imm()?;
                let acc = self.read_reg(EAX);
                self.test(acc, imm);
                Ok(StepExit::Continue)
            }

            0xAA | 0xAB => self.string_op(opcode).map(|_| StepExit::Continue),

            // MOV r, imm
            0xB0..=0xB7 => {
                let imm = self.fetch8()?;
                self.st.set8(opcode - 0xB0, imm);
                Ok(StepExit::Continue)
            }
            0xB8..=0xBF => {
                let reg = opcode - 0xB8;
                let imm = self.fetch_imm()?;
                self.write_reg(reg, imm);
                Ok(StepExit::Continue)
            }

            0xC1 => self.group_shift().map(|_| StepExit::Continue),

            0xC3 => {
                self.st.eip = self.pop()?;
                Ok(StepExit::Branch)
            }

            // MOV r/m, imm
            0xC6 => {
                let m = self.parse_modrm()?;
                let imm = self.fetch8()?;
                self.write_rm8(m.operand, imm)?;
                Ok(StepExit::Continue)
            }
            0xC7 => {
                let m = self.parse_modrm()?;
                let imm = self.fetch_imm()?;
                self.write_rm(m.operand, imm)?;
                Ok(StepExit::Continue)
            }

            0xC9 => {
                // LEAVE: collapse the frame, then pop the saved frame pointer.
                if self.wide {
                    let ebp = self.st.get32(EBP);
                    self.st.set32(ESP, ebp);
                    let v = self.pop()?;
                    self.st.set32(EBP, v);
                } else {
                    let bp = self.st.get16(EBP);
                    self.st.set16(ESP, bp);
                    let v = self.pop()?;
                    self.st.set16(EBP, v as u16);
                }
                Ok(StepExit::Continue)
            }

            0xCD => self.int_imm8(),

            // IN/OUT
            0xE4 => {
                let port = self.fetch8()? as u16;
                let v = self.bus.io_read(port, 1)?;
                self.st.set8(0, v as u8);
                Ok(StepExit::Continue)
            }
            0xE6 => {
                let port = self.fetch8()? as u16;
                let al = self.st.get8(0);
                self.bus.io_write(port, 1, al as u32)?;
                Ok(StepExit::Continue)
            }
            0xEC => {
                let port = self.st.get16(EDX);
                let v = self.bus.io_read(port, 1)?;
                self.st.set8(0, v as u8);
                Ok(StepExit::Continue)
            }
            0xEE => {
                let port = self.st.get16(EDX);
                let al = self.st.get8(0);
                self.bus.io_write(port, 1, al as u32)?;
                Ok(StepExit::Continue)
            }
            0xEF => {
                let port = self.st.get16(EDX);
                if self.wide {
                    let v = self.st.get32(EAX);
                    self.bus.io_write(port, 4, v)?;
                } else {
                    let v = self.st.get16(EAX);
                    self.bus.io_write(port, 2, v as u32)?;
                }
                Ok(StepExit::Continue)
            }

            // CALL/JMP
            0xE8 => {
                let rel = self.fetch_rel()?;
                let ret = self.st.eip;
                self.push(ret)?;
                self.st.eip = ret.wrapping_add(rel as u32);
                Ok(StepExit::Branch)
            }
            0xE9 => {
                let rel = self.fetch_rel()?;
                self.st.eip = self.st.eip.wrapping_add(rel as u32);
                Ok(StepExit::Branch)
            }
            0xEA => {
                // Far jump: new offset, then the CS selector. The segment
                // write is what commits a pending real/protected switch.
                let offset = self.fetch_imm()?;
                let selector = self.fetch16()?;
                self.st.eip = offset;
                self.st.set_sreg(CS, selector);
                Ok(StepExit::Branch)
            }
            0xEB => {
                let disp = self.fetch8()? as i8 as i32;
                self.st.eip = self.st.eip.wrapping_add(disp as u32);
                Ok(StepExit::Branch)
            }

            0xF4 => Ok(StepExit::Halted),

            0xF6 | 0xF7 => self.group_unary(opcode).map(|_| StepExit::Continue),

            0xFA => {
                self.st.eflags.remove(Eflags::IF);
                Ok(StepExit::Continue)
            }
            0xFC => {
                self.st.eflags.remove(Eflags::DF);
                Ok(StepExit::Continue)
            }

            0xFF => self.group_ff(),

            _ => Err(Exception::UndefinedOpcode {
                eip: self.start,
                opcode,
            }),
        }
    }

    /// moffs address: operand-size-wide absolute offset.
    fn fetch_moffs(&mut self) -> Result<u32, Exception> {
        if self.wide {
            self.fetch32()
        } else {
            Ok(self.fetch16()? as u32)
        }
    }

    /// IMUL r, r/m, imm (word/dword immediate, or sign-extended byte).
    fn imul_imm(&mut self, byte_imm: bool) -> Result<(), Exception> {
        let m = self.parse_modrm()?;
        let src = self.read_rm(m.operand)?;
        let imm: i32 = if byte_imm {
            self.fetch8()? as i8 as i32
        } else if self.wide {
            self.fetch32()? as i32
        } else {
            self.fetch16()? as i16 as i32
        };
        let src_signed: i64 = if self.wide {
            src as i32 as i64
        } else {
            src as u16 as i16 as i64
        };
        let product = src_signed.wrapping_mul(imm as i64);
        self.write_reg(m.reg, product as u32);
        Ok(())
    }

    /// Software interrupt. Only the two INT 10h services the boot path uses
    /// are wired up; everything else is logged and skipped, since no IDT
    /// dispatch exists in this machine model.
    fn int_imm8(&mut self) -> Result<StepExit, Exception> {
        let vector = self.fetch8()?;
        if vector != 0x10 {
            warn!(vector, "unhandled software interrupt");
            return Ok(StepExit::Continue);
        }
        let ah = self.st.get8(4);
        match ah {
            0x00 => debug!(mode = self.st.get8(0), "int 10h: set video mode"),
            0x0E => {
                // Teletype output: AL goes to the serial sink.
                let al = self.st.get8(0);
                self.bus.io_write(0x3F8, 1, al as u32)?;
            }
            _ => warn!(ah, "int 10h: unhandled service"),
        }
        Ok(StepExit::Continue)
    }
}
