//! Bootloader flash-control commands.
//!
//! The secondary bootloader exposes an 8-byte control block at
//! [`CONTROL_BLOCK_OFFSET`] of its CAN variable. Writing it issues a command
//! (CTRL layout); reading it returns the flash state (INFO layout).
//!
//! ```text
//! CTRL  | size: u24 LE | cmd: u8 | crc: u32 LE |
//! INFO  | status | current_block | pref_block | reset_src | reserved x4 |
//! ```

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Offset of the control block inside the bootloader variable.
pub const CONTROL_BLOCK_OFFSET: u32 = 0x0008_0000;

/// Size of the control block in bytes.
pub const CONTROL_BLOCK_LEN: usize = 8;

/// Last command completed and the image loaded.
pub const STATUS_LOAD_OK: u8 = 0x10;

/// Error bit.
pub const STATUS_MASK_ERR: u8 = 0x80;

/// Error bits that are not fatal.
pub const STATUS_MASK_NIX_ERR: u8 = 0xC0;

/// Unrecoverable bootloader state.
pub const STATUS_FATAL_ERR: u8 = 0xFF;

/// Flash bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Bank {
    /// Main image (0).
    Main = 0,
    /// Reserve image (1).
    Reserve = 1,
}

impl Bank {
    /// Bank number as used on the wire.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// The other bank.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Main => Self::Reserve,
            Self::Reserve => Self::Main,
        }
    }
}

impl TryFrom<u8> for Bank {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Main),
            1 => Ok(Self::Reserve),
            other => Err(Error::Validation(format!(
                "bank {other} does not exist (expected 0 or 1)"
            ))),
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "0 (main)"),
            Self::Reserve => write!(f, "1 (reserve)"),
        }
    }
}

/// Command opcodes. Bank-specific commands carry the bank in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Erase the half of flash not holding the primary image.
    EraseSecondHalf = 0x02,
    /// Recompute and compare the CRC of a bank.
    CheckCrc = 0x04,
    /// Run the validity check of a bank.
    CheckValid = 0x06,
    /// Force the valid flag of a bank.
    FixValid = 0x08,
    /// Select the bank booted next.
    SetPref = 0x0A,
    /// Copy the staged image over the active bank and jump to it.
    CopyAndGo = 0x0C,
    /// Soft reset.
    Restart = 0x0E,
    /// Erase one sector.
    EraseOneSector = 0x12,
}

impl Opcode {
    /// Human-readable command name.
    pub fn name(self) -> &'static str {
        match self {
            Self::EraseSecondHalf => "erase-half",
            Self::CheckCrc => "check-crc",
            Self::CheckValid => "check-valid",
            Self::FixValid => "fix-valid",
            Self::SetPref => "set-pref",
            Self::CopyAndGo => "copy-and-go",
            Self::Restart => "restart",
            Self::EraseOneSector => "erase-sector",
        }
    }

    fn with_bank(self, bank: Bank) -> u8 {
        self as u8 | bank.index()
    }
}

/// Outbound control block (CTRL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashCtrl {
    /// Size field (24 bits).
    pub size: u32,
    /// Command byte, opcode plus bank bit.
    pub cmd: u8,
    /// CRC field.
    pub crc: u32,
}

impl FlashCtrl {
    fn plain(cmd: u8) -> Self {
        Self {
            size: 0,
            cmd,
            crc: 0,
        }
    }

    /// Select `bank` for the next boot.
    pub fn set_preferred(bank: Bank) -> Self {
        Self::plain(Opcode::SetPref.with_bank(bank))
    }

    /// Run the validity check on `bank`.
    pub fn check_valid(bank: Bank) -> Self {
        Self::plain(Opcode::CheckValid.with_bank(bank))
    }

    /// Compare the CRC of the first `size` bytes of `bank` against `crc`.
    pub fn check_crc(bank: Bank, size: u32, crc: u32) -> Self {
        Self {
            size,
            cmd: Opcode::CheckCrc.with_bank(bank),
            crc,
        }
    }

    /// Force the valid flag on `bank`.
    pub fn fix_valid(bank: Bank) -> Self {
        Self::plain(Opcode::FixValid.with_bank(bank))
    }

    /// Erase the second half of flash.
    pub fn erase_second_half() -> Self {
        Self::plain(Opcode::EraseSecondHalf as u8)
    }

    /// Erase one sector; the index wraps modulo 8.
    pub fn erase_sector(sector: u8) -> Self {
        Self {
            size: u32::from(sector % 8),
            cmd: Opcode::EraseOneSector as u8,
            crc: 0,
        }
    }

    /// Soft reset.
    pub fn restart() -> Self {
        Self::plain(Opcode::Restart as u8)
    }

    /// Copy the staged image of `size` bytes with `crc` and jump to it.
    pub fn copy_and_go(size: u32, crc: u32) -> Self {
        Self {
            size,
            cmd: Opcode::CopyAndGo as u8,
            crc,
        }
    }

    /// Opcode without the bank bit, if known.
    pub fn opcode(&self) -> Option<Opcode> {
        match self.cmd {
            0x02 => Some(Opcode::EraseSecondHalf),
            0x04 | 0x05 => Some(Opcode::CheckCrc),
            0x06 | 0x07 => Some(Opcode::CheckValid),
            0x08 | 0x09 => Some(Opcode::FixValid),
            0x0A | 0x0B => Some(Opcode::SetPref),
            0x0C => Some(Opcode::CopyAndGo),
            0x0E => Some(Opcode::Restart),
            0x12 => Some(Opcode::EraseOneSector),
            _ => None,
        }
    }

    /// Command name for logs and errors.
    pub fn name(&self) -> &'static str {
        self.opcode().map_or("unknown", Opcode::name)
    }

    /// Encode to the 8-byte wire layout.
    pub fn encode(&self) -> [u8; CONTROL_BLOCK_LEN] {
        let mut out = [0u8; CONTROL_BLOCK_LEN];
        LittleEndian::write_u24(&mut out[0..3], self.size & 0x00FF_FFFF);
        out[3] = self.cmd;
        LittleEndian::write_u32(&mut out[4..8], self.crc);
        out
    }

    /// Parse the 8-byte wire layout.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data)?;
        Ok(Self {
            size: LittleEndian::read_u24(&data[0..3]),
            cmd: data[3],
            crc: LittleEndian::read_u32(&data[4..8]),
        })
    }
}

/// Inbound control block (INFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashInfo {
    /// Status bits.
    pub status: u8,
    /// Bank currently executing.
    pub current_block: u8,
    /// Bank selected for next boot.
    pub pref_block: u8,
    /// Cause of the last reset.
    pub reset_src: u8,
}

impl FlashInfo {
    /// Parse the 8-byte control block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data)?;
        Ok(Self {
            status: data[0],
            current_block: data[1],
            pref_block: data[2],
            reset_src: data[3],
        })
    }

    /// Error bit set.
    pub fn is_error(&self) -> bool {
        self.status & STATUS_MASK_ERR != 0
    }

    /// Load-ok bit set.
    pub fn is_load_ok(&self) -> bool {
        self.status & STATUS_LOAD_OK != 0
    }

    /// Derived state.
    pub fn state(&self) -> FlashState {
        if self.is_error() {
            FlashState::Error
        } else {
            FlashState::Ok
        }
    }
}

/// Summary of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashState {
    /// No error bit.
    Ok,
    /// Error bit set.
    Error,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::Error => write!(f, "Error"),
        }
    }
}

fn check_len(data: &[u8]) -> Result<()> {
    if data.len() != CONTROL_BLOCK_LEN {
        return Err(Error::Protocol(format!(
            "control block is {} bytes, expected {CONTROL_BLOCK_LEN}",
            data.len()
        )));
    }
    Ok(())
}
