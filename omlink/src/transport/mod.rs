//! Register transport boundary.
//!
//! Everything above this module talks to the module through two operations:
//! read a run of holding registers and write a run of registers. Two links
//! implement them:
//!
//! - [`rtu::ModbusRtu`]: direct serial link, Modbus RTU framing
//! - [`can_bridge::CanBridge`]: registers reached through a CAN variable
//!
//! ```text
//! +------------------+
//! |  OmClient        |
//! +--------+---------+
//!          | Request
//! +--------v---------+
//! |  Worker thread   |
//! +--------+---------+
//!          | RegisterTransport
//! +--------v---------+     +------------------+
//! |  ModbusRtu<Port> |  or |  CanBridge<Link> |
//! +------------------+     +------------------+
//! ```

pub mod can_bridge;
pub mod rtu;

use std::fmt;

use crate::error::{Error, Result};

/// Register-level access to one device link.
pub trait RegisterTransport: Send {
    /// Read `count` holding registers starting at `address`.
    fn read(&mut self, address: u16, count: u16, target: u8) -> Result<Vec<u16>>;

    /// Write `registers` starting at `address`.
    fn write(&mut self, address: u16, registers: &[u16], target: u8) -> Result<()>;
}

impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    fn read(&mut self, address: u16, count: u16, target: u8) -> Result<Vec<u16>> {
        (**self).read(address, count, target)
    }

    fn write(&mut self, address: u16, registers: &[u16], target: u8) -> Result<()> {
        (**self).write(address, registers, target)
    }
}

/// Operation carried by a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Read holding registers.
    Read {
        /// First register.
        address: u16,
        /// Number of registers.
        count: u16,
    },
    /// Write multiple registers.
    WriteMultiple {
        /// First register.
        address: u16,
        /// Values to write.
        registers: Vec<u16>,
    },
}

/// One register operation addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation.
    pub kind: RequestKind,
    /// Bus address of the device.
    pub target_id: u8,
}

impl Request {
    /// Read `count` registers at `address`.
    pub fn read(address: u16, count: u16, target_id: u8) -> Self {
        Self {
            kind: RequestKind::Read { address, count },
            target_id,
        }
    }

    /// Write `registers` at `address`.
    pub fn write(address: u16, registers: Vec<u16>, target_id: u8) -> Self {
        Self {
            kind: RequestKind::WriteMultiple { address, registers },
            target_id,
        }
    }

    /// Run the request against `transport`.
    pub fn execute<T: RegisterTransport + ?Sized>(&self, transport: &mut T) -> Result<Response> {
        match &self.kind {
            RequestKind::Read { address, count } => transport
                .read(*address, *count, self.target_id)
                .map(Response::Registers),
            RequestKind::WriteMultiple { address, registers } => transport
                .write(*address, registers, self.target_id)
                .map(|()| Response::Written),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RequestKind::Read { address, count } => write!(
                f,
                "read {count} @ {address:#06x} (target {})",
                self.target_id
            ),
            RequestKind::WriteMultiple { address, registers } => write!(
                f,
                "write {} @ {address:#06x} (target {})",
                registers.len(),
                self.target_id
            ),
        }
    }
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Registers returned by a read.
    Registers(Vec<u16>),
    /// A write was acknowledged.
    Written,
}

impl Response {
    /// Registers of a read response.
    pub fn into_registers(self) -> Result<Vec<u16>> {
        match self {
            Self::Registers(regs) => Ok(regs),
            Self::Written => Err(Error::Protocol(
                "expected registers, got write acknowledgement".to_string(),
            )),
        }
    }
}
