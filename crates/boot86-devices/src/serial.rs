//! 16550 UART reduced to polled byte transfer on COM1.
//!
//! The transmitter holding register forwards straight to the host sink and
//! the line-status register always reports the transmitter empty, so guest
//! polling loops complete immediately. Receive blocks on the host source;
//! end-of-input reads as zero.

use std::io::{self, Read, Write};

pub const PORT_THR: u16 = 0x3F8;
pub const PORT_RBR: u16 = 0x3F8;
pub const PORT_LSR: u16 = 0x3FD;

/// Transmitter holding register empty.
pub const LSR_THR_EMPTY: u8 = 0x20;

pub struct Uart16550 {
    source: Box<dyn Read>,
    sink: Box<dyn Write>,
}

impl Uart16550 {
    pub fn new(source: Box<dyn Read>, sink: Box<dyn Write>) -> Self {
        Uart16550 { source, sink }
    }

    pub fn write_thr(&mut self, byte: u8) -> io::Result<()> {
        self.sink.write_all(&[byte])?;
        self.sink.flush()
    }

    pub fn read_rbr(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        let n = self.source.read(&mut byte)?;
        Ok(if n == 1 { byte[0] } else { 0 })
    }
}
