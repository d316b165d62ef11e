//! Direct serial link using Modbus RTU framing.
//!
//! Only the two function codes the module implements are supported.
//!
//! ```text
//! Read holding registers (0x03)
//!   request   | slave | 0x03 | addr BE | count BE | CRC16 LE |
//!   response  | slave | 0x03 | bytes   | data BE ...| CRC16 LE |
//!
//! Write multiple registers (0x10)
//!   request   | slave | 0x10 | addr BE | qty BE | bytes | data BE ... | CRC16 LE |
//!   response  | slave | 0x10 | addr BE | qty BE | CRC16 LE |
//!
//! Exception
//!   response  | slave | fc | 0x80 | code | CRC16 LE |
//! ```

use std::io::ErrorKind;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::trace;

use crate::{
    error::{Error, Result},
    port::Port,
    protocol::crc::crc16_modbus,
    transport::RegisterTransport,
};

/// Read holding registers.
pub const FC_READ_HOLDING: u8 = 0x03;

/// Write multiple registers.
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Exception flag on the function code of a response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest read the protocol allows.
pub const MAX_READ_COUNT: u16 = 125;

/// Largest write the protocol allows.
pub const MAX_WRITE_COUNT: u16 = 123;

/// Modbus RTU client over a serial [`Port`].
pub struct ModbusRtu<P: Port> {
    port: P,
}

impl<P: Port> ModbusRtu<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the client and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Build a read-holding-registers request frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_request(slave: u8, address: u16, count: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8);
        frame.push(slave);
        frame.push(FC_READ_HOLDING);
        frame.write_u16::<BigEndian>(address).unwrap();
        frame.write_u16::<BigEndian>(count).unwrap();
        append_crc(&mut frame);
        frame
    }

    /// Build a write-multiple-registers request frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_request(slave: u8, address: u16, registers: &[u16]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(9 + registers.len() * 2);
        frame.push(slave);
        frame.push(FC_WRITE_MULTIPLE);
        frame.write_u16::<BigEndian>(address).unwrap();
        frame
            .write_u16::<BigEndian>(registers.len() as u16)
            .unwrap();
        frame.push((registers.len() * 2) as u8);
        for reg in registers {
            frame.write_u16::<BigEndian>(*reg).unwrap();
        }
        append_crc(&mut frame);
        frame
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        trace!("RTU TX: {frame:02X?}");
        self.port.clear_buffers()?;
        self.port.write_all_bytes(frame)
    }

    /// Read exactly `buf.len()` bytes or fail with a timeout.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Timeout(format!(
                        "RTU reply: got {filled} of {} bytes",
                        buf.len()
                    )));
                },
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(Error::Timeout(format!(
                        "RTU reply: got {filled} of {} bytes",
                        buf.len()
                    )));
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Read a reply to `function` from `slave`; returns the full frame.
    fn receive(
        &mut self,
        slave: u8,
        function: u8,
        body_len: impl Fn(&[u8]) -> usize,
    ) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; 3];
        self.read_exact(&mut frame)?;

        if frame[1] == function | EXCEPTION_FLAG {
            let mut tail = [0u8; 2];
            self.read_exact(&mut tail)?;
            frame.extend_from_slice(&tail);
            trace!("RTU RX: {frame:02X?}");
            check_crc(&frame)?;
            return Err(Error::Transport(format!(
                "slave {} exception {:#04x} ({})",
                frame[0],
                frame[2],
                exception_name(frame[2])
            )));
        }

        let rest = body_len(&frame) + 2;
        let start = frame.len();
        frame.resize(start + rest, 0);
        self.read_exact(&mut frame[start..])?;
        trace!("RTU RX: {frame:02X?}");
        check_crc(&frame)?;

        if frame[0] != slave {
            return Err(Error::Protocol(format!(
                "reply from slave {}, expected {slave}",
                frame[0]
            )));
        }
        if frame[1] != function {
            return Err(Error::Protocol(format!(
                "reply function {:#04x}, expected {function:#04x}",
                frame[1]
            )));
        }
        Ok(frame)
    }
}

#[cfg(feature = "native")]
impl ModbusRtu<crate::port::NativePort> {
    /// Open a serial port and wrap it.
    pub fn open(config: &crate::port::SerialConfig) -> Result<Self> {
        crate::port::NativePort::open(config).map(Self::new)
    }
}

impl<P: Port> RegisterTransport for ModbusRtu<P> {
    fn read(&mut self, address: u16, count: u16, target: u8) -> Result<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(Error::Validation(format!(
                "read of {count} registers outside 1..={MAX_READ_COUNT}"
            )));
        }
        self.send(&Self::read_request(target, address, count))?;

        // Header is slave, function, byte count.
        let frame = self.receive(target, FC_READ_HOLDING, |header| {
            usize::from(header[2])
        })?;
        let byte_count = usize::from(frame[2]);
        if byte_count != usize::from(count) * 2 {
            return Err(Error::Protocol(format!(
                "read returned {byte_count} bytes for {count} registers"
            )));
        }
        Ok(frame[3..3 + byte_count]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect())
    }

    fn write(&mut self, address: u16, registers: &[u16], target: u8) -> Result<()> {
        if registers.is_empty() || registers.len() > usize::from(MAX_WRITE_COUNT) {
            return Err(Error::Validation(format!(
                "write of {} registers outside 1..={MAX_WRITE_COUNT}",
                registers.len()
            )));
        }
        self.send(&Self::write_request(target, address, registers))?;

        // Echo is slave, function, address (2), quantity (2).
        let frame = self.receive(target, FC_WRITE_MULTIPLE, |_| 3)?;
        let echoed_address = BigEndian::read_u16(&frame[2..4]);
        let echoed_qty = BigEndian::read_u16(&frame[4..6]);
        if echoed_address != address || usize::from(echoed_qty) != registers.len() {
            return Err(Error::Protocol(format!(
                "write echo {echoed_qty} @ {echoed_address:#06x}, expected {} @ {address:#06x}",
                registers.len()
            )));
        }
        Ok(())
    }
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn check_crc(frame: &[u8]) -> Result<()> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16_modbus(body);
    let got = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != got {
        return Err(Error::Protocol(format!(
            "RTU CRC mismatch: expected {expected:#06x}, got {got:#06x}"
        )));
    }
    Ok(())
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        _ => "unknown",
    }
}
