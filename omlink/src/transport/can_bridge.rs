//! Register access tunneled through a CAN variable.
//!
//! A CAN node with a Modbus master port exposes variable 9 as a mailbox:
//!
//! ```text
//! offset 0   | exec | port | fcode | slave | addr LE | count LE |
//! offset 8   | register data, big-endian per register ...       |
//! ```
//!
//! A read writes the header with function 0x03, waits for the node to run
//! the transaction and reads header plus data back. A write stores the
//! register data first and then writes the header with function 0x10.

use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::trace;

use crate::{
    error::{Error, Result},
    transport::{
        RegisterTransport,
        rtu::{FC_READ_HOLDING, FC_WRITE_MULTIPLE},
    },
};

/// Mailbox variable on the bridge node.
pub const BRIDGE_VAR_ID: u8 = 9;

/// Default CAN device number of the bridge node.
pub const DEFAULT_BRIDGE_DEV_ID: u8 = 4;

/// Size of the mailbox header.
pub const HEADER_LEN: usize = 8;

/// Time the bridge needs to complete a read on its Modbus port.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

/// Access to CAN variables of a node.
///
/// Implemented by the external USB-CAN driver.
pub trait CanVarLink: Send {
    /// Write `payload` to variable `var` of node `dev` at `offset`.
    fn write_var(&mut self, dev: u8, var: u8, offset: u32, payload: &[u8]) -> Result<()>;

    /// Read `len` bytes of variable `var` of node `dev` from `offset`.
    fn read_var(&mut self, dev: u8, var: u8, offset: u32, len: usize) -> Result<Vec<u8>>;
}

/// Register transport over a CAN variable mailbox.
pub struct CanBridge<L: CanVarLink> {
    link: L,
    dev_id: u8,
    port: u8,
    settle: Duration,
}

impl<L: CanVarLink> CanBridge<L> {
    /// Bridge through node [`DEFAULT_BRIDGE_DEV_ID`], Modbus port 0.
    pub fn new(link: L) -> Self {
        Self {
            link,
            dev_id: DEFAULT_BRIDGE_DEV_ID,
            port: 0,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Set the CAN device number of the bridge node.
    #[must_use]
    pub fn with_dev_id(mut self, dev_id: u8) -> Self {
        self.dev_id = dev_id;
        self
    }

    /// Set the Modbus port of the bridge node.
    #[must_use]
    pub fn with_port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    /// Set the wait between a read command and fetching its result.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Get a reference to the underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    fn header(&self, function: u8, target: u8, address: u16, count: u16) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[1] = self.port;
        header[2] = function;
        header[3] = target;
        LittleEndian::write_u16(&mut header[4..6], address);
        LittleEndian::write_u16(&mut header[6..8], count);
        header
    }
}

impl<L: CanVarLink> RegisterTransport for CanBridge<L> {
    fn read(&mut self, address: u16, count: u16, target: u8) -> Result<Vec<u16>> {
        let header = self.header(FC_READ_HOLDING, target, address, count);
        trace!("CAN bridge read header: {header:02X?}");
        self.link
            .write_var(self.dev_id, BRIDGE_VAR_ID, 0, &header)?;

        thread::sleep(self.settle);

        let len = HEADER_LEN + usize::from(count) * 2;
        let data = self
            .link
            .read_var(self.dev_id, BRIDGE_VAR_ID, 0, len)?;
        if data.len() < len {
            return Err(Error::Protocol(format!(
                "CAN bridge returned {} bytes, expected {len}",
                data.len()
            )));
        }
        Ok(data[HEADER_LEN..len]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect())
    }

    fn write(&mut self, address: u16, registers: &[u16], target: u8) -> Result<()> {
        let count = u16::try_from(registers.len())
            .map_err(|_| Error::Validation("too many registers for one write".to_string()))?;
        let payload: Vec<u8> = registers
            .iter()
            .flat_map(|reg| reg.to_be_bytes())
            .collect();
        self.link.write_var(
            self.dev_id,
            BRIDGE_VAR_ID,
            HEADER_LEN as u32,
            &payload,
        )?;

        let header = self.header(FC_WRITE_MULTIPLE, target, address, count);
        trace!("CAN bridge write header: {header:02X?}");
        self.link
            .write_var(self.dev_id, BRIDGE_VAR_ID, 0, &header)
    }
}
