//! Raw firmware images.
//!
//! Images have no header. Their payload size and CRC are found by scanning
//! for the trailer (see [`locate_trailer`]):
//!
//! ```text
//! +---------------------------+----------+-----------+
//! |         payload           | fix word | size word |
//! +---------------------------+----------+-----------+
//! |  CRC over payload ++ fix = 0         | words/4   |
//! ```

use std::path::Path;

use log::debug;

use crate::{
    error::{Error, Result},
    protocol::{
        bootloader::{Bank, FlashCtrl},
        crc::{TrailerInfo, locate_trailer},
    },
};

/// Filler for the unused tail of a chunk; matches erased flash.
pub const PAD_BYTE: u8 = 0xFE;

/// A firmware image with its scanned trailer.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    trailer: TrailerInfo,
}

impl FirmwareImage {
    /// Load and scan an image file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            Error::InvalidFirmware(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_bytes(data)
    }

    /// Scan an image held in memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let trailer = locate_trailer(&data)?;
        debug!(
            "Firmware scan: file {} bytes, firmware {} bytes, CRC {:#010x}, crc_matched={}, size_matched={}",
            trailer.file_size,
            trailer.firmware_size,
            trailer.crc,
            trailer.crc_matched,
            trailer.size_matched
        );
        Ok(Self { data, trailer })
    }

    /// Raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Trailer scan result.
    pub fn trailer(&self) -> &TrailerInfo {
        &self.trailer
    }

    /// File length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that the image can be uploaded.
    pub fn validate(&self) -> Result<()> {
        let t = &self.trailer;
        if !t.crc_matched {
            return Err(Error::InvalidFirmware(
                "CRC trailer not found".to_string(),
            ));
        }
        if !t.size_matched {
            return Err(Error::InvalidFirmware(format!(
                "size word after offset {:#x} does not match",
                t.firmware_size
            )));
        }
        if t.payload_size() == 0 {
            return Err(Error::InvalidFirmware("firmware size is zero".to_string()));
        }
        if self.data.len() % 4 != 0 {
            return Err(Error::InvalidFirmware(format!(
                "file length {} is not a multiple of 4",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// CRC-check command for `bank` against this image.
    pub fn check_crc_command(&self, bank: Bank) -> Result<FlashCtrl> {
        self.require_crc()?;
        Ok(FlashCtrl::check_crc(
            bank,
            self.trailer.payload_size(),
            self.trailer.crc,
        ))
    }

    /// Copy-and-go command for this image.
    pub fn copy_and_go_command(&self) -> Result<FlashCtrl> {
        self.require_crc()?;
        Ok(FlashCtrl::copy_and_go(
            self.trailer.payload_size(),
            self.trailer.crc,
        ))
    }

    fn require_crc(&self) -> Result<()> {
        if self.trailer.crc_matched {
            Ok(())
        } else {
            Err(Error::InvalidFirmware(
                "CRC trailer not found".to_string(),
            ))
        }
    }
}

/// Pad `chunk` to `size` bytes with [`PAD_BYTE`].
pub fn pad_chunk(chunk: &[u8], size: usize) -> Vec<u8> {
    let mut out = chunk.to_vec();
    if out.len() < size {
        out.resize(size, PAD_BYTE);
    }
    out
}

/// Split `data` into `(base + offset, chunk)` pairs of `chunk_size` bytes.
///
/// A short final chunk is padded with [`PAD_BYTE`].
pub fn firmware_chunks(
    base: u32,
    data: &[u8],
    chunk_size: usize,
) -> impl Iterator<Item = (u32, Vec<u8>)> + '_ {
    data.chunks(chunk_size.max(1))
        .enumerate()
        .map(move |(i, chunk)| {
            (
                base + (i * chunk_size) as u32,
                pad_chunk(chunk, chunk_size),
            )
        })
}
