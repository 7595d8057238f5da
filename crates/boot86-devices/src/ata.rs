//! ATA PIO in the minimal form an xv6-class boot path uses.
//!
//! The drive is addressed through the classic 0x1F0 task-file registers.
//! Writing the LBA-low register rewinds and seeks; the remaining taskfile
//! writes accumulate onto the cursor, so programming LBA low-to-high lands
//! the cursor on `lba * 512`. Data-port reads then stream bytes from the
//! image, one per transfer. Reads past end-of-image yield zeros.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

/// Bytes per sector.
pub const SECTOR_SIZE: u64 = 512;

pub const PORT_DATA: u16 = 0x1F0;
pub const PORT_SECTOR_COUNT: u16 = 0x1F2;
pub const PORT_LBA_LOW: u16 = 0x1F3;
pub const PORT_LBA_MID: u16 = 0x1F4;
pub const PORT_LBA_HIGH: u16 = 0x1F5;
pub const PORT_DRIVE_HEAD: u16 = 0x1F6;
pub const PORT_COMMAND: u16 = 0x1F7;
pub const PORT_STATUS: u16 = 0x1F7;

/// Drive ready.
const STATUS_RDY: u8 = 0x50;
/// Drive ready with data requested.
const STATUS_RDY_DRQ: u8 = 0x58;

/// READ SECTORS (with retry).
const CMD_READ_SECTORS: u8 = 0x20;

/// Random-access backing image for the emulated drive.
pub trait DiskImage: Read + Seek {}

impl<T: Read + Seek> DiskImage for T {}

pub struct AtaController {
    disk: Box<dyn DiskImage>,
    cursor: u64,
    status_reads: u32,
    sector_count: u8,
}

impl AtaController {
    pub fn new(disk: Box<dyn DiskImage>) -> Self {
        AtaController {
            disk,
            cursor: 0,
            status_reads: 0,
            sector_count: 0,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// One byte of PIO data from the current cursor.
    pub fn read_data(&mut self) -> io::Result<u8> {
        self.disk.seek(SeekFrom::Start(self.cursor))?;
        let mut byte = [0u8; 1];
        let n = self.disk.read(&mut byte)?;
        self.cursor += 1;
        // Short read means the image ended; the guest sees zeros.
        Ok(if n == 1 { byte[0] } else { 0 })
    }

    /// Status alternates ready / ready+DRQ so polling loops make progress.
    pub fn read_status(&mut self) -> u8 {
        let status = if self.status_reads & 1 == 0 {
            STATUS_RDY
        } else {
            STATUS_RDY_DRQ
        };
        self.status_reads += 1;
        status
    }

    pub fn write_sector_count(&mut self, value: u8) {
        self.sector_count = value;
        debug!(count = value, "ata: sector count");
    }

    pub fn write_lba_low(&mut self, value: u8) {
        // LBA programming starts over at bits 0-7.
        self.cursor = value as u64 * SECTOR_SIZE;
        debug!(lba_low = value, cursor = self.cursor, "ata: seek");
    }

    pub fn write_lba_mid(&mut self, value: u8) {
        self.cursor += ((value as u64) << 8) * SECTOR_SIZE;
        debug!(lba_mid = value, cursor = self.cursor, "ata: seek");
    }

    pub fn write_lba_high(&mut self, value: u8) {
        self.cursor += ((value as u64) << 16) * SECTOR_SIZE;
        debug!(lba_high = value, cursor = self.cursor, "ata: seek");
    }

    pub fn write_drive_head(&mut self, value: u8) {
        self.cursor += (((value & 0x1F) as u64) << 24) * SECTOR_SIZE;
        debug!(drive_head = value, cursor = self.cursor, "ata: seek");
    }

    pub fn write_command(&mut self, value: u8) {
        if value == CMD_READ_SECTORS {
            debug!(sectors = self.sector_count, "ata: read sectors");
        } else {
            debug!(command = value, "ata: command");
        }
    }
}
