//! Shared test bus and step helpers.
#![allow(dead_code)]

use std::collections::HashMap;

use boot86_cpu_core::{step, CpuBus, CpuMode, CpuState, Exception, StepExit};

/// Flat test bus: zero-filled reads, dropped out-of-range writes, scripted
/// port input, and a log of every port write.
pub struct TestBus {
    pub mem: Vec<u8>,
    /// Bytes served to `io_read`, per port, front first.
    pub io_input: HashMap<u16, Vec<u8>>,
    /// Every `io_write` as (port, size, value).
    pub io_writes: Vec<(u16, u32, u32)>,
}

impl TestBus {
    pub fn new(size: usize) -> Self {
        TestBus {
            mem: vec![0; size],
            io_input: HashMap::new(),
            io_writes: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn feed_port(&mut self, port: u16, bytes: &[u8]) {
        self.io_input.entry(port).or_default().extend_from_slice(bytes);
    }

    fn io_pop(&mut self, port: u16) -> u8 {
        match self.io_input.get_mut(&port) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => 0,
        }
    }

    /// Non-mutating little-endian peek for assertions.
    pub fn read_u32_at(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.mem[addr as usize],
            self.mem[addr as usize + 1],
            self.mem[addr as usize + 2],
            self.mem[addr as usize + 3],
        ])
    }

    /// Non-mutating little-endian peek for assertions.
    pub fn read_u16_at(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.mem[addr as usize], self.mem[addr as usize + 1]])
    }
}

impl CpuBus for TestBus {
    fn read_u8(&mut self, paddr: u32) -> Result<u8, Exception> {
        Ok(self.mem.get(paddr as usize).copied().unwrap_or(0))
    }

    fn read_u16(&mut self, paddr: u32) -> Result<u16, Exception> {
        let lo = self.read_u8(paddr)? as u16;
        let hi = self.read_u8(paddr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read_u32(&mut self, paddr: u32) -> Result<u32, Exception> {
        let lo = self.read_u16(paddr)? as u32;
        let hi = self.read_u16(paddr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn read_u64(&mut self, paddr: u32) -> Result<u64, Exception> {
        let lo = self.read_u32(paddr)? as u64;
        let hi = self.read_u32(paddr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u8(&mut self, paddr: u32, value: u8) -> Result<(), Exception> {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = value;
        }
        Ok(())
    }

    fn write_u16(&mut self, paddr: u32, value: u16) -> Result<(), Exception> {
        self.write_u8(paddr, value as u8)?;
        self.write_u8(paddr.wrapping_add(1), (value >> 8) as u8)
    }

    fn write_u32(&mut self, paddr: u32, value: u32) -> Result<(), Exception> {
        self.write_u16(paddr, value as u16)?;
        self.write_u16(paddr.wrapping_add(2), (value >> 16) as u16)
    }

    fn io_read(&mut self, port: u16, size: u32) -> Result<u32, Exception> {
        let mut out = 0u32;
        for i in 0..size {
            out |= (self.io_pop(port) as u32) << (i * 8);
        }
        Ok(out)
    }

    fn io_write(&mut self, port: u16, size: u32, value: u32) -> Result<(), Exception> {
        self.io_writes.push((port, size, value));
        Ok(())
    }
}

/// Protected-mode CPU at EIP 0x7C00 with PE already committed.
pub fn prot32() -> CpuState {
    let mut st = CpuState::new(CpuMode::Prot32);
    st.cr[0] = 0x11; // ET | PE
    st.eip = 0x7C00;
    st
}

/// Real-mode CPU at EIP 0x7C00, power-on CR0.
pub fn real16() -> CpuState {
    let mut st = CpuState::new(CpuMode::Real16);
    st.cr[0] = 0x10; // ET
    st.eip = 0x7C00;
    st
}

/// Load `bytes` at EIP and retire one instruction.
pub fn exec_one(st: &mut CpuState, bus: &mut TestBus, bytes: &[u8]) -> StepExit {
    bus.load(st.eip, bytes);
    step(st, bus).expect("step")
}

/// Load `bytes` at EIP and expect the step to fail.
pub fn exec_err(st: &mut CpuState, bus: &mut TestBus, bytes: &[u8]) -> Exception {
    bus.load(st.eip, bytes);
    step(st, bus).expect_err("step should fail")
}
