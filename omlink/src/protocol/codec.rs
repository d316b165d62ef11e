//! Byte buffer to register conversion.
//!
//! The module packs logical byte buffers into 16-bit registers with the
//! first byte of each pair in the low half, but transmits every register
//! big-endian. The two helpers below are therefore not inverses of each
//! other:
//!
//! ```text
//! bytes        [0x01, 0x02]
//! registers    [0x0201]                 bytes_to_registers
//! bytes        [0x02, 0x01]             registers_to_bytes
//! ```
//!
//! Outbound writes apply [`swap_registers`] before sending so that the device
//! receives the packed byte sequence in order.

/// Pack a byte buffer into registers, `(lo, hi)` pairs as `(hi << 8) | lo`.
///
/// An odd-length buffer is padded with one zero byte.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| {
            let lo = u16::from(pair[0]);
            let hi = pair.get(1).copied().map_or(0, u16::from);
            (hi << 8) | lo
        })
        .collect()
}

/// Unpack registers into bytes, high byte first for each register.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers
        .iter()
        .flat_map(|reg| reg.to_be_bytes())
        .collect()
}

/// Byte-swap every register in place.
pub fn swap_registers(registers: &mut [u16]) {
    for reg in registers {
        *reg = reg.swap_bytes();
    }
}

/// Registers to put on the wire so the device sees `bytes` in order.
pub fn wire_registers(bytes: &[u8]) -> Vec<u16> {
    let mut regs = bytes_to_registers(bytes);
    swap_registers(&mut regs);
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_packs_low_first() {
        assert_eq!(bytes_to_registers(&[0x34, 0x12]), vec![0x1234]);
    }

    #[test]
    fn test_odd_length_padded_with_zero() {
        assert_eq!(bytes_to_registers(&[0xAA, 0xBB, 0xCC]), vec![0xBBAA, 0x00CC]);
    }

    #[test]
    fn test_registers_emitted_big_endian() {
        assert_eq!(registers_to_bytes(&[0x1234, 0xABCD]), vec![0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn test_packing_and_unpacking_invert_byte_order() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        let back = registers_to_bytes(&bytes_to_registers(&bytes));
        assert_ne!(back, bytes);
        assert_eq!(back, vec![0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_wire_registers_preserve_byte_order() {
        let bytes = [0x00, 0x00, 0x00, 0x0B, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(registers_to_bytes(&wire_registers(&bytes)), bytes);
    }

    #[test]
    fn test_empty_input() {
        assert!(bytes_to_registers(&[]).is_empty());
        assert!(registers_to_bytes(&[]).is_empty());
    }
}
