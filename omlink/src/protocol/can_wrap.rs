//! Virtual CAN frames tunneled through the boot register window.
//!
//! The bootloader listens on a CAN variable. Over the register link it is
//! reached by writing a CAN frame image into the boot block and reading the
//! same window back for the answer.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+----------+-------------+--------+----------+-----------------+
//! | Bus | Reserved |   Type ID   |  DLC   | Reserved |      Data       |
//! +-----+----------+-------------+--------+----------+-----------------+
//! |  1  |    1     | 4 bytes LE  |   1    |    1     | DLC bytes (W)   |
//! +-----+----------+-------------+--------+----------+-----------------+
//! ```
//!
//! The response window is always 16 bytes with a 16-bit data length and
//! eight data bytes.
//!
//! Type ID bits, most significant first:
//!
//! ```text
//! | dev:4 | var:4 | offset:21 | res:1 | RTR:1 | res:1 |
//! ```

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// CAN variable served by the bootloader.
pub const BOOTLOADER_VAR_ID: u8 = 14;

/// Highest CAN bus number accepted by the module.
pub const MAX_BUS_ID: u8 = 2;

/// Bus the module routes bootloader traffic on.
pub const DEFAULT_BUS_ID: u8 = 1;

/// Size of the response window in bytes.
pub const CAN_FRAME_LEN: usize = 16;

/// Minimum data length code put in a request.
pub const MIN_DLC: usize = 8;

const OFFSET_MASK: u32 = (1 << 21) - 1;

/// Decoded type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId {
    /// Device number (4 bits).
    pub dev: u8,
    /// Variable number (4 bits).
    pub var: u8,
    /// Byte offset inside the variable (21 bits).
    pub offset: u32,
    /// Remote transmission request.
    pub rtr: bool,
}

impl TypeId {
    /// Pack into the 32-bit identifier. Offset is masked to 21 bits.
    pub fn pack(self) -> u32 {
        (u32::from(self.dev & 0x0F) << 28)
            | (u32::from(self.var & 0x0F) << 24)
            | ((self.offset & OFFSET_MASK) << 3)
            | (u32::from(self.rtr) << 1)
    }

    /// Unpack a 32-bit identifier.
    pub fn unpack(raw: u32) -> Self {
        Self {
            dev: (raw >> 28) as u8,
            var: ((raw >> 24) & 0x0F) as u8,
            offset: (raw >> 3) & OFFSET_MASK,
            rtr: raw & 0x02 != 0,
        }
    }
}

/// Outbound virtual CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanWrapRequest {
    /// CAN bus number (0, 1 or 2).
    pub bus_id: u8,
    /// Destination device number.
    pub dev_id: u8,
    /// Destination variable; must be [`BOOTLOADER_VAR_ID`].
    pub var_id: u8,
    /// Byte offset inside the variable.
    pub offset: u32,
    /// Read request when set; the frame then carries no data.
    pub rtr: bool,
    /// Payload for a write request.
    pub data: Vec<u8>,
    /// Requested data length; raised to [`MIN_DLC`].
    pub len: usize,
}

impl CanWrapRequest {
    /// Write `data` at `offset` of the bootloader variable.
    pub fn write(offset: u32, data: &[u8]) -> Self {
        Self {
            bus_id: DEFAULT_BUS_ID,
            dev_id: 0,
            var_id: BOOTLOADER_VAR_ID,
            offset,
            rtr: false,
            data: data.to_vec(),
            len: data.len(),
        }
    }

    /// Request the bootloader variable at `offset`.
    pub fn read(offset: u32) -> Self {
        Self {
            bus_id: DEFAULT_BUS_ID,
            dev_id: 0,
            var_id: BOOTLOADER_VAR_ID,
            offset,
            rtr: true,
            data: Vec::new(),
            len: 0,
        }
    }

    /// Set the bus number.
    #[must_use]
    pub fn with_bus(mut self, bus_id: u8) -> Self {
        self.bus_id = bus_id;
        self
    }

    /// Set the device number.
    #[must_use]
    pub fn with_dev(mut self, dev_id: u8) -> Self {
        self.dev_id = dev_id;
        self
    }

    /// Set the variable number.
    #[must_use]
    pub fn with_var(mut self, var_id: u8) -> Self {
        self.var_id = var_id;
        self
    }

    /// Type identifier of this request.
    pub fn type_id(&self) -> TypeId {
        TypeId {
            dev: self.dev_id,
            var: self.var_id,
            offset: self.offset,
            rtr: self.rtr,
        }
    }

    /// Check the request without encoding it.
    pub fn validate(&self) -> Result<()> {
        if self.bus_id > MAX_BUS_ID {
            return Err(Error::Validation(format!(
                "CAN bus {} out of range 0..={MAX_BUS_ID}",
                self.bus_id
            )));
        }
        if self.var_id != BOOTLOADER_VAR_ID {
            return Err(Error::Validation(format!(
                "CAN variable {} is not the bootloader variable {BOOTLOADER_VAR_ID}",
                self.var_id
            )));
        }
        if !self.rtr && self.data.is_empty() {
            return Err(Error::Validation(
                "write frame without data".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode the frame bytes written into the tunnel window.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let len = self.len.max(MIN_DLC);
        let mut frame = Vec::with_capacity(CAN_FRAME_LEN);
        frame.push(self.bus_id);
        frame.push(0x00);
        frame
            .write_u32::<LittleEndian>(self.type_id().pack())
            .unwrap();
        frame.push(len.min(usize::from(u8::MAX)) as u8);
        frame.push(0x00);

        if !self.rtr {
            let take = len.min(self.data.len());
            frame.extend_from_slice(&self.data[..take]);
        }
        Ok(frame)
    }
}

/// Decoded tunnel response window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanWrapResponse {
    /// Bus the answer came from.
    pub bus_id: u8,
    /// Raw type identifier.
    pub type_id: u32,
    /// Data length reported by the module.
    pub data_len: u16,
    /// Eight data bytes.
    pub data: [u8; 8],
}

impl CanWrapResponse {
    /// Parse the 16-byte response window.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CAN_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "CAN wrap response is {} bytes, expected {CAN_FRAME_LEN}",
                bytes.len()
            )));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            bus_id: bytes[0],
            type_id: LittleEndian::read_u32(&bytes[2..6]),
            data_len: LittleEndian::read_u16(&bytes[6..8]),
            data,
        })
    }

    /// Decoded type identifier.
    pub fn type_fields(&self) -> TypeId {
        TypeId::unpack(self.type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_layout() {
        let id = TypeId {
            dev: 0,
            var: BOOTLOADER_VAR_ID,
            offset: 0x00080000,
            rtr: true,
        };
        assert_eq!(id.pack(), 0x0E40_0002);
    }

    #[test]
    fn test_offset_masked_to_21_bits() {
        let id = TypeId {
            dev: 0,
            var: BOOTLOADER_VAR_ID,
            offset: 0x0030_0010,
            rtr: false,
        };
        assert_eq!(TypeId::unpack(id.pack()).offset, 0x0010_0010);
    }

    #[test]
    fn test_read_request_has_no_data() {
        let frame = CanWrapRequest::read(0x00080000).encode().unwrap();
        assert_eq!(frame, vec![0x01, 0x00, 0x02, 0x00, 0x40, 0x0E, 0x08, 0x00]);
    }

    #[test]
    fn test_write_request_carries_data() {
        let data = [0, 0, 0, 0x0B, 0, 0, 0, 0];
        let frame = CanWrapRequest::write(0x00080000, &data).encode().unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..8], &[0x01, 0x00, 0x00, 0x00, 0x40, 0x0E, 0x08, 0x00]);
        assert_eq!(&frame[8..], &data);
    }

    #[test]
    fn test_short_write_keeps_minimum_dlc() {
        let frame = CanWrapRequest::write(0x10, &[0xAA, 0xBB]).encode().unwrap();
        assert_eq!(frame[6], 8);
        assert_eq!(&frame[8..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_rejects_bus_out_of_range() {
        let err = CanWrapRequest::read(0).with_bus(3).encode().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_other_variable() {
        let err = CanWrapRequest::read(0).with_var(9).encode().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_empty_write() {
        let err = CanWrapRequest::write(0, &[]).encode().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_build_then_parse_recovers_fields() {
        for bus in 0..=MAX_BUS_ID {
            let req = CanWrapRequest::write(0x1F_FFF8, &[1, 2, 3, 4, 5, 6, 7, 8])
                .with_bus(bus)
                .with_dev(5);
            let frame = req.encode().unwrap();
            let resp = CanWrapResponse::parse(&frame).unwrap();

            assert_eq!(resp.bus_id, bus);
            assert_eq!(resp.data, [1, 2, 3, 4, 5, 6, 7, 8]);
            let fields = resp.type_fields();
            assert_eq!(fields, req.type_id());
            assert_eq!(fields.dev, 5);
            assert_eq!(fields.var, BOOTLOADER_VAR_ID);
            assert_eq!(fields.offset, 0x1F_FFF8);
            assert!(!fields.rtr);
        }
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = CanWrapResponse::parse(&[0; 15]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
