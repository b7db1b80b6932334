//! Packet and row checksums.

use crc::{CRC_32_ISCSI, Crc};

/// CRC-32C (Castagnoli), the row checksum the bootloader verifies.
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// 16-bit two's complement of the byte sum.
///
/// `(sum(bytes) + checksum(bytes)) & 0xFFFF == 0` for every input.
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    sum.wrapping_neg()
}

/// CRC-32C over a whole row, computed before the row is chunked.
pub fn row_checksum(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum16(bytes: &[u8]) -> u16 {
        bytes
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
    }

    #[test]
    fn test_empty() {
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_known_response() {
        // Enter DFU response captured from a PSoC 6 target.
        let packet = [
            0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01,
        ];
        assert_eq!(checksum(&packet), 0xFFF2);
    }

    #[test]
    fn test_sum_cancels() {
        let inputs: [&[u8]; 4] = [
            &[0xFF; 300],
            &[0x01, 0x38, 0x04, 0x00, 0x01, 0x02, 0x03, 0x04],
            &[0x80],
            &[0xFF; 257],
        ];
        for bytes in inputs {
            assert_eq!(sum16(bytes).wrapping_add(checksum(bytes)), 0);
        }

        for len in [0usize, 1, 2, 7, 64, 255, 256, 1024] {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37 + len) as u8).collect();
            assert_eq!(sum16(&bytes).wrapping_add(checksum(&bytes)), 0, "len {len}");
        }
    }

    #[test]
    fn test_crc32c_check_value() {
        assert_eq!(row_checksum(b"123456789"), 0xE306_9283);
    }
}
