//! Checksums used on the wire and in firmware images.
//!
//! - CRC32 as computed by the STM32 CRC peripheral (polynomial `0x04C11DB7`,
//!   init `0xFFFFFFFF`, no reflection, no final XOR, fed one little-endian
//!   32-bit word at a time, most significant byte first).
//! - CRC-16/MODBUS for RTU framing.

use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_16_MODBUS, Crc};

use crate::error::{Error, Result};

/// CRC32 polynomial of the STM32 CRC unit.
pub const CRC32_POLY: u32 = 0x04C11DB7;

/// Initial value of the running CRC32.
pub const CRC32_INIT: u32 = 0xFFFFFFFF;

/// MSB-first lookup table for [`CRC32_POLY`], built at compile time.
pub static CRC32_TABLE: [u32; 256] = build_table();

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 0x8000_0000 != 0 {
                (c << 1) ^ CRC32_POLY
            } else {
                c << 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// Running STM32-compatible CRC32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32Stm {
    value: u32,
}

impl Default for Crc32Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32Stm {
    /// Start a new CRC at [`CRC32_INIT`].
    pub const fn new() -> Self {
        Self::with_init(CRC32_INIT)
    }

    /// Start a new CRC at an arbitrary value.
    pub const fn with_init(value: u32) -> Self {
        Self { value }
    }

    /// Feed one 32-bit word, most significant byte first.
    pub fn update_word(&mut self, word: u32) {
        let mut crc = self.value;
        for byte in word.to_be_bytes() {
            crc = (crc << 8) ^ CRC32_TABLE[((crc >> 24) as u8 ^ byte) as usize];
        }
        self.value = crc;
    }

    /// Feed a buffer of little-endian words.
    ///
    /// The length must be a multiple of 4.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % 4 != 0 {
            return Err(Error::Validation(format!(
                "CRC32 input length {} is not a multiple of 4",
                data.len()
            )));
        }
        for chunk in data.chunks_exact(4) {
            self.update_word(LittleEndian::read_u32(chunk));
        }
        Ok(())
    }

    /// Current CRC value.
    pub const fn value(&self) -> u32 {
        self.value
    }
}

/// CRC32 of `data` starting from `init`.
pub fn crc32_stm(data: &[u8], init: u32) -> Result<u32> {
    let mut crc = Crc32Stm::with_init(init);
    crc.update(data)?;
    Ok(crc.value())
}

/// CRC-16/MODBUS of `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// Result of scanning a firmware image for its size/CRC trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrailerInfo {
    /// Length of the scanned buffer in bytes.
    pub file_size: u32,
    /// Byte offset at which the running CRC reached zero.
    pub firmware_size: u32,
    /// CRC of the payload, i.e. the running value one word before zero.
    pub crc: u32,
    /// The running CRC reached zero.
    pub crc_matched: bool,
    /// The word following the zero point equals `firmware_size / 4`.
    pub size_matched: bool,
}

impl TrailerInfo {
    /// Payload length sent in the size field of CRC-check commands.
    pub fn payload_size(&self) -> u32 {
        self.firmware_size.saturating_sub(4)
    }
}

/// Walk `data` word by word and locate the self-describing trailer.
///
/// Before consuming each word the running CRC is checked for zero. At the
/// first zero, the word at that position is compared against the position
/// divided by 4. The image layout is `payload ++ fix word ++ size word`,
/// where the fix word zeroes the CRC and the size word holds the number of
/// words before it.
pub fn locate_trailer(data: &[u8]) -> Result<TrailerInfo> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::InvalidFirmware(format!(
            "image length {} is not a non-zero multiple of 4",
            data.len()
        )));
    }
    let file_size = u32::try_from(data.len())
        .map_err(|_| Error::InvalidFirmware("image larger than 4 GiB".to_string()))?;

    let mut crc = Crc32Stm::new();
    let mut prev = crc.value();

    for (index, chunk) in data.chunks_exact(4).enumerate() {
        let addr = (index * 4) as u32;
        let word = LittleEndian::read_u32(chunk);
        if crc.value() == 0 {
            return Ok(TrailerInfo {
                file_size,
                firmware_size: addr,
                crc: prev,
                crc_matched: true,
                size_matched: u64::from(addr) == u64::from(word) * 4,
            });
        }
        prev = crc.value();
        crc.update_word(word);
    }

    Ok(TrailerInfo {
        file_size,
        firmware_size: file_size,
        crc: if crc.value() == 0 { prev } else { crc.value() },
        crc_matched: crc.value() == 0,
        size_matched: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPEG2: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_MPEG_2);

    /// Payload, then the word that zeroes the CRC, then the word count.
    fn build_image(payload: &[u8]) -> Vec<u8> {
        let mut image = payload.to_vec();
        let fix = crc32_stm(payload, CRC32_INIT).unwrap();
        image.extend_from_slice(&fix.to_le_bytes());
        let words = (image.len() / 4) as u32;
        image.extend_from_slice(&words.to_le_bytes());
        image
    }

    #[test]
    fn test_table_entries() {
        assert_eq!(CRC32_TABLE[0], 0);
        assert_eq!(CRC32_TABLE[1], CRC32_POLY);
        assert_eq!(CRC32_TABLE[255], 0xB1F740B4);
    }

    #[test]
    fn test_zero_word_matches_hardware() {
        assert_eq!(crc32_stm(&[0, 0, 0, 0], CRC32_INIT).unwrap(), 0xC704DD7B);
    }

    #[test]
    fn test_known_vector() {
        let data: Vec<u8> = (1..=12).collect();
        assert_eq!(crc32_stm(&data, CRC32_INIT).unwrap(), 0x61B3C1AF);
    }

    #[test]
    fn test_matches_mpeg2_over_reversed_words() {
        let data: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
        let reversed: Vec<u8> = data
            .chunks_exact(4)
            .flat_map(|w| [w[3], w[2], w[1], w[0]])
            .collect();
        assert_eq!(crc32_stm(&data, CRC32_INIT).unwrap(), MPEG2.checksum(&reversed));
    }

    #[test]
    fn test_deterministic() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let a = crc32_stm(&data, CRC32_INIT).unwrap();
        let b = crc32_stm(&data, CRC32_INIT).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let data: Vec<u8> = (0..32).collect();
        let mut crc = Crc32Stm::new();
        crc.update(&data[..16]).unwrap();
        crc.update(&data[16..]).unwrap();
        assert_eq!(crc.value(), crc32_stm(&data, CRC32_INIT).unwrap());
    }

    #[test]
    fn test_rejects_unaligned_input() {
        let err = crc32_stm(&[1, 2, 3], CRC32_INIT).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_appending_crc_zeroes_it() {
        let image = build_image(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(crc32_stm(&image[..12], CRC32_INIT).unwrap(), 0);
        assert_eq!(
            image,
            vec![
                0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x8E, 0x88, 0x12, 0x37, 0x03, 0x00,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_locate_trailer_round_trip() {
        let payload: Vec<u8> = (0..40u8).collect();
        let image = build_image(&payload);
        let info = locate_trailer(&image).unwrap();

        assert_eq!(info.file_size, 48);
        assert_eq!(info.firmware_size, 44);
        assert!(info.crc_matched);
        assert!(info.size_matched);
        assert_eq!(info.crc, crc32_stm(&payload, CRC32_INIT).unwrap());
        assert_eq!(info.payload_size(), 40);
    }

    #[test]
    fn test_locate_trailer_wrong_size_word() {
        let mut image = build_image(&[1, 2, 3, 4]);
        let len = image.len();
        image[len - 4] = 0x09;
        let info = locate_trailer(&image).unwrap();
        assert!(info.crc_matched);
        assert!(!info.size_matched);
        assert_eq!(info.firmware_size, 8);
    }

    #[test]
    fn test_locate_trailer_no_zero() {
        let info = locate_trailer(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(!info.crc_matched);
        assert!(!info.size_matched);
        assert_eq!(info.firmware_size, 8);
    }

    #[test]
    fn test_locate_trailer_rejects_bad_length() {
        assert!(matches!(locate_trailer(&[]), Err(Error::InvalidFirmware(_))));
        assert!(matches!(
            locate_trailer(&[0; 6]),
            Err(Error::InvalidFirmware(_))
        ));
    }

    #[test]
    fn test_crc16_modbus_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
        // Read 1 holding register at 0 from slave 1.
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }
}
