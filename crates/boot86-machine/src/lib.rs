//! The assembled machine: CPU core wired to guest RAM, the port space, and
//! the APIC MMIO windows, with the boot-time firmware state applied.
//!
//! One [`Machine::step`] call retires one guest instruction and bumps the
//! retired-instruction counter that trace harnesses key off. The backing
//! store for guest RAM is a compile-time choice; the default sparse store
//! covers the full 32-bit space.

use std::io::{self, Read, Write};

use boot86_cpu_core::state::{CpuSnapshot, EAX, EDX, ESP};
use boot86_cpu_core::{step, CpuBus, CpuState, Exception};

pub use boot86_cpu_core::state;
pub use boot86_cpu_core::{CpuMode, Eflags, StepExit};
use boot86_devices::{DiskImage, IoApic, IoPorts, LocalApic, IOAPIC_BASE, LAPIC_BASE};
use boot86_memory::{Backing, MemoryBus, SparseBacking};
use thiserror::Error;

/// Load address of the boot image.
pub const IMAGE_BASE: u32 = 0x7C00;

/// Each APIC register window spans one page.
const MMIO_WINDOW: u32 = 0x1000;

/// Fatal machine-level conditions.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("cpu fault: {0}")]
    Cpu(#[from] Exception),

    /// A host read or write behind a port failed. Emulator state is left
    /// as-is; the caller may retry or abort.
    #[error("host I/O failed behind port {port:#06x}")]
    HostIo {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Why a run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The guest executed HLT.
    Halted,
    /// The stop predicate fired (for [`Machine::run`]: EIP reached 0 or
    /// returned to the image base).
    Stopped,
}

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Initial stack pointer.
    pub esp: u32,
    /// Start with protection already enabled and 32-bit decoding committed.
    pub protected: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            esp: 0x6F04,
            protected: false,
        }
    }
}

/// The machine bus: routes CPU physical accesses to RAM with the APIC
/// windows interposed, and port I/O to the device models.
struct MachineBus<B: Backing> {
    mem: MemoryBus<B>,
    io: IoPorts,
    lapic: LocalApic,
    ioapic: IoApic,
    /// Host error captured while surfacing `Exception::HostIo`.
    host_error: Option<io::Error>,
}

impl<B: Backing> MachineBus<B> {
    fn io_result<T>(&mut self, port: u16, result: io::Result<T>) -> Result<T, Exception> {
        result.map_err(|source| {
            self.host_error = Some(source);
            Exception::HostIo { port }
        })
    }
}

fn in_window(addr: u32, base: u32) -> bool {
    addr >= base && addr < base + MMIO_WINDOW
}

impl<B: Backing> CpuBus for MachineBus<B> {
    fn read_u8(&mut self, paddr: u32) -> Result<u8, Exception> {
        Ok(self.mem.read_u8(paddr))
    }

    fn read_u16(&mut self, paddr: u32) -> Result<u16, Exception> {
        Ok(self.mem.read_u16(paddr))
    }

    fn read_u32(&mut self, paddr: u32) -> Result<u32, Exception> {
        if in_window(paddr, IOAPIC_BASE) {
            return Ok(self.ioapic.mmio_read(paddr - IOAPIC_BASE));
        }
        Ok(self.mem.read_u32(paddr))
    }

    fn read_u64(&mut self, paddr: u32) -> Result<u64, Exception> {
        Ok(self.mem.read_u64(paddr))
    }

    fn write_u8(&mut self, paddr: u32, value: u8) -> Result<(), Exception> {
        self.mem.write_u8(paddr, value);
        Ok(())
    }

    fn write_u16(&mut self, paddr: u32, value: u16) -> Result<(), Exception> {
        self.mem.write_u16(paddr, value);
        Ok(())
    }

    fn write_u32(&mut self, paddr: u32, value: u32) -> Result<(), Exception> {
        // The windows keep normal memory semantics; the device models only
        // observe the traffic.
        if in_window(paddr, IOAPIC_BASE) {
            self.ioapic.mmio_write(paddr - IOAPIC_BASE, value);
        } else if in_window(paddr, LAPIC_BASE) {
            self.lapic.note_write(paddr - LAPIC_BASE, value);
        }
        self.mem.write_u32(paddr, value);
        Ok(())
    }

    fn io_read(&mut self, port: u16, size: u32) -> Result<u32, Exception> {
        let result = match size {
            4 => self.io.read32(port),
            2 => self.io.read16(port).map(u32::from),
            _ => self.io.read8(port).map(u32::from),
        };
        self.io_result(port, result)
    }

    fn io_write(&mut self, port: u16, size: u32, value: u32) -> Result<(), Exception> {
        let result = match size {
            4 => self.io.write32(port, value),
            2 => self.io.write16(port, value as u16),
            _ => self.io.write8(port, value as u8),
        };
        self.io_result(port, result)
    }
}

pub struct Machine<B: Backing = SparseBacking> {
    cpu: CpuState,
    bus: MachineBus<B>,
    retired: u64,
}

impl Machine<SparseBacking> {
    /// Build the default machine around a boot image, a disk image, and the
    /// host serial endpoints.
    pub fn new(
        config: MachineConfig,
        image: &[u8],
        disk: Box<dyn DiskImage>,
        serial_in: Box<dyn Read>,
        serial_out: Box<dyn Write>,
    ) -> Self {
        Machine::with_backing(SparseBacking::new(), config, image, disk, serial_in, serial_out)
    }
}

impl<B: Backing> Machine<B> {
    pub fn with_backing(
        backing: B,
        config: MachineConfig,
        image: &[u8],
        disk: Box<dyn DiskImage>,
        serial_in: Box<dyn Read>,
        serial_out: Box<dyn Write>,
    ) -> Self {
        let mut mem = MemoryBus::new(backing);
        mem.write_physical(IMAGE_BASE, image);
        boot86_firmware::install(&mut mem);

        let mode = if config.protected {
            CpuMode::Prot32
        } else {
            CpuMode::Real16
        };
        let mut cpu = CpuState::new(mode);
        cpu.eip = IMAGE_BASE;
        cpu.set32(ESP, config.esp);
        // Register state a BIOS hand-off leaves behind: the boot signature
        // in EAX and the boot drive in EDX.
        cpu.set32(EAX, 0x0000_AA55);
        cpu.set32(EDX, 0x0000_0080);
        cpu.cr[0] = if config.protected { 0x11 } else { 0x10 };

        Machine {
            cpu,
            bus: MachineBus {
                mem,
                io: IoPorts::new(disk, serial_in, serial_out),
                lapic: LocalApic::new(),
                ioapic: IoApic::new(boot86_firmware::APIC_ID),
                host_error: None,
            },
            retired: 0,
        }
    }

    /// Retire exactly one guest instruction.
    pub fn step(&mut self) -> Result<StepExit, MachineError> {
        match step(&mut self.cpu, &mut self.bus) {
            Ok(exit) => {
                self.retired += 1;
                tracing::trace!(retired = self.retired, eip = self.cpu.eip, ?exit, "step");
                Ok(exit)
            }
            Err(Exception::HostIo { port }) => {
                let source = self.bus.host_error.take().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "host I/O failure")
                });
                Err(MachineError::HostIo { port, source })
            }
            Err(fault) => Err(MachineError::Cpu(fault)),
        }
    }

    /// Step until HLT or until `stop` fires after a retired instruction.
    pub fn run_until(
        &mut self,
        mut stop: impl FnMut(&CpuState) -> bool,
    ) -> Result<RunExit, MachineError> {
        loop {
            if self.step()? == StepExit::Halted {
                return Ok(RunExit::Halted);
            }
            if stop(&self.cpu) {
                return Ok(RunExit::Stopped);
            }
        }
    }

    /// Step until the guest halts or control leaves the image (EIP 0 or
    /// back at the load address).
    pub fn run(&mut self) -> Result<RunExit, MachineError> {
        self.run_until(|cpu| cpu.eip == 0 || cpu.eip == IMAGE_BASE)
    }

    /// Instructions retired so far.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Register trace record for the current state.
    pub fn snapshot(&self) -> CpuSnapshot {
        self.cpu.snapshot()
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn memory(&self) -> &MemoryBus<B> {
        &self.bus.mem
    }

    /// ATA byte cursor, surfaced for diagnostics.
    pub fn ata_cursor(&self) -> u64 {
        self.bus.io.ata_cursor()
    }
}
