//! Guest-visible device models: the port I/O bus and the APIC MMIO windows.
//!
//! The port space is a 64 KiB latch array with per-port side effects layered
//! on top, so a port with no device behind it still reads back the last
//! value written. Multi-byte port transfers decompose into byte transfers at
//! the same port, which is exactly the latched behavior the ATA data port
//! relies on for 32-bit PIO.

pub mod ata;
pub mod i8042;
pub mod ioapic;
pub mod lapic;
pub mod serial;

use std::io;

use ata::AtaController;
use serial::Uart16550;

pub use ata::{DiskImage, SECTOR_SIZE};
pub use i8042::{I8042_DATA_PORT, I8042_STATUS_PORT};
pub use ioapic::{IoApic, IOAPIC_BASE};
pub use lapic::{LocalApic, LAPIC_BASE};

/// Port-indexed I/O space with the ATA, UART, and keyboard models attached.
pub struct IoPorts {
    latch: Box<[u8; 0x1_0000]>,
    ata: AtaController,
    uart: Uart16550,
}

impl IoPorts {
    /// Build the port space around a disk image and the host serial
    /// endpoints. A caller that wants non-blocking serial input injects a
    /// pre-buffered reader.
    pub fn new(
        disk: Box<dyn DiskImage>,
        serial_in: Box<dyn io::Read>,
        serial_out: Box<dyn io::Write>,
    ) -> Self {
        IoPorts {
            latch: Box::new([0u8; 0x1_0000]),
            ata: AtaController::new(disk),
            uart: Uart16550::new(serial_in, serial_out),
        }
    }

    /// Read one byte from a port.
    pub fn read8(&mut self, port: u16) -> io::Result<u8> {
        let value = match port {
            I8042_STATUS_PORT => i8042::STATUS_READY,
            ata::PORT_DATA => self.ata.read_data()?,
            ata::PORT_STATUS => self.ata.read_status(),
            serial::PORT_RBR => self.uart.read_rbr()?,
            serial::PORT_LSR => serial::LSR_THR_EMPTY,
            _ => self.latch[port as usize],
        };
        self.latch[port as usize] = value;
        Ok(value)
    }

    /// Write one byte to a port.
    pub fn write8(&mut self, port: u16, value: u8) -> io::Result<()> {
        self.latch[port as usize] = value;
        match port {
            ata::PORT_SECTOR_COUNT => self.ata.write_sector_count(value),
            ata::PORT_LBA_LOW => self.ata.write_lba_low(value),
            ata::PORT_LBA_MID => self.ata.write_lba_mid(value),
            ata::PORT_LBA_HIGH => self.ata.write_lba_high(value),
            ata::PORT_DRIVE_HEAD => self.ata.write_drive_head(value),
            ata::PORT_COMMAND => self.ata.write_command(value),
            serial::PORT_THR => self.uart.write_thr(value)?,
            I8042_DATA_PORT | I8042_STATUS_PORT => {}
            _ => {}
        }
        Ok(())
    }

    /// Read a word as two byte transfers at the same port.
    pub fn read16(&mut self, port: u16) -> io::Result<u16> {
        let mut out = 0u16;
        for i in 0..2 {
            out |= (self.read8(port)? as u16) << (i * 8);
        }
        Ok(out)
    }

    /// Read a dword as four byte transfers at the same port.
    pub fn read32(&mut self, port: u16) -> io::Result<u32> {
        let mut out = 0u32;
        for i in 0..4 {
            out |= (self.read8(port)? as u32) << (i * 8);
        }
        Ok(out)
    }

    /// Write a word as two byte transfers at the same port.
    pub fn write16(&mut self, port: u16, value: u16) -> io::Result<()> {
        for i in 0..2 {
            self.write8(port, (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    /// Write a dword as four byte transfers at the same port.
    pub fn write32(&mut self, port: u16, value: u32) -> io::Result<()> {
        for i in 0..4 {
            self.write8(port, (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    /// Current ATA byte cursor, for tests and diagnostics.
    pub fn ata_cursor(&self) -> u64 {
        self.ata.cursor()
    }
}
