//! Register map of the sensor module.
//!
//! Addresses are register indices. Each block is a base address plus
//! `(offset, length)` pairs for the fields inside it.

/// Flag OR-ed into an address to bypass the module's data cache.
pub const DIRECT_FLAG: u16 = 0x8000;

/// A field inside a register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Offset from the block base, in registers.
    pub offset: u16,
    /// Length in registers.
    pub len: u16,
}

impl Field {
    const fn new(offset: u16, len: u16) -> Self {
        Self { offset, len }
    }

    /// Absolute address of this field inside `base`.
    pub const fn address(self, base: u16) -> u16 {
        base + self.offset
    }
}

/// Command and status block.
pub mod command {
    use super::Field;

    /// Block base address.
    pub const BASE: u16 = 0x1000;
    /// Command word followed by its payload.
    pub const COMMAND: Field = Field::new(0, 1);
    /// Status words.
    pub const STATUS: Field = Field::new(10, 8);
    /// Firmware version (patch, minor, major).
    pub const FW_VERSION: Field = Field::new(20, 3);
    /// Flash region the firmware runs from.
    pub const CURRENT_REGION: Field = Field::new(23, 1);
    /// Manufacturer identifier.
    pub const MNF_ID: Field = Field::new(24, 2);
    /// Die temperatures.
    pub const TEMPERATURE: Field = Field::new(26, 3);
    /// Bus device identifier.
    pub const DEV_ID: Field = Field::new(30, 1);
    /// Short git hash of the firmware build.
    pub const GIT_HASH: Field = Field::new(32, 4);

    /// Command code for a forced reboot.
    pub const CMD_REBOOT: u16 = 0xFE;
    /// Command code for changing the device identifier.
    pub const CMD_SET_ID: u16 = 0x13;
}

/// Sun sensor data block.
pub const SUN_SENSOR_BASE: u16 = 0x2000;

/// Horizon sensor data block.
pub const HORIZON_SENSOR_BASE: u16 = 0x3000;

/// Gyroscope, accelerometer and magnetometer block.
pub const INERTIAL_BASE: u16 = 0x4000;

/// Boot block holding the virtual CAN window.
pub mod boot {
    use super::Field;

    /// Block base address.
    pub const BASE: u16 = 0xF000;
    /// 16-byte virtual CAN frame.
    pub const CAN_WRAP: Field = Field::new(0, 8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_addresses() {
        assert_eq!(command::FW_VERSION.address(command::BASE), 0x1014);
        assert_eq!(command::DEV_ID.address(command::BASE), 0x101E);
        assert_eq!(boot::CAN_WRAP.address(boot::BASE), 0xF000);
    }

    #[test]
    fn test_can_window_is_one_frame() {
        assert_eq!(usize::from(boot::CAN_WRAP.len) * 2, 16);
    }
}
