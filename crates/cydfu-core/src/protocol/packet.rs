//! Packet framing shared by every command and response.
//!
//! ```text
//! +-------+------+--------+-----------+----------+------+
//! | Start | Code | Length |  Payload  | Checksum | End  |
//! +-------+------+--------+-----------+----------+------+
//! |  1    |  1   | 2 (LE) |  Length   |  2 (LE)  |  1   |
//! | 0x01  |      |        |           |          | 0x17 |
//! +-------+------+--------+-----------+----------+------+
//! ```
//!
//! `Code` is the command byte on the way out and the status byte on the way back.
//! The checksum covers Start through the end of the payload.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::checksum::checksum;
use super::command::Command;
use super::constants::{
    END_OF_PACKET, MAX_PAYLOAD_LEN, PACKET_HEADER_LEN, PACKET_OVERHEAD, START_OF_PACKET,
};
use super::status::StatusCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Payload of {len} bytes exceeds the {max}-byte length field")]
    Encoding { len: usize, max: usize },

    #[error("Malformed packet: {0}")]
    Malformed(MalformedReason),

    #[error("Corrupt packet: checksum 0x{received:04X}, computed 0x{computed:04X}")]
    Corrupt { received: u16, computed: u16 },
}

/// Why a packet failed structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    TooShort { len: usize },
    BadDelimiters { start: u8, end: u8 },
    LengthMismatch { declared: usize, actual: usize },
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedReason::TooShort { len } => {
                write!(f, "{len} bytes is shorter than the {PACKET_OVERHEAD}-byte frame")
            }
            MalformedReason::BadDelimiters { start, end } => {
                write!(f, "delimiters 0x{start:02X}/0x{end:02X}")
            }
            MalformedReason::LengthMismatch { declared, actual } => {
                write!(f, "length field says {declared}, frame carries {actual}")
            }
        }
    }
}

/// A validated packet borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    /// Status byte (responses) or command byte (commands).
    pub code: u8,
    pub payload: &'a [u8],
}

impl DecodedPacket<'_> {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_byte(self.code)
    }
}

/// Frame `payload` behind an arbitrary code byte.
pub fn encode_frame(code: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PacketError::Encoding {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(payload.len() + PACKET_OVERHEAD);
    buf.push(START_OF_PACKET);
    buf.push(code);
    // Bounded above by MAX_PAYLOAD_LEN.
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    let cs = checksum(&buf);
    buf.extend_from_slice(&cs.to_le_bytes());
    buf.push(END_OF_PACKET);
    Ok(buf)
}

/// Build a command packet.
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    encode_frame(command.as_byte(), payload)
}

/// Build a response packet (device side; used by the mock transport and tests).
pub fn encode_response(status: StatusCode, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    encode_frame(status.as_byte(), payload)
}

/// Validate and split a received packet.
///
/// Checks, in order: minimum size, delimiters, length field, checksum.
pub fn decode(buf: &[u8]) -> Result<DecodedPacket<'_>, PacketError> {
    if buf.len() < PACKET_OVERHEAD {
        return Err(PacketError::Malformed(MalformedReason::TooShort {
            len: buf.len(),
        }));
    }

    let start = buf[0];
    let end = buf[buf.len() - 1];
    if start != START_OF_PACKET || end != END_OF_PACKET {
        return Err(PacketError::Malformed(MalformedReason::BadDelimiters {
            start,
            end,
        }));
    }

    let declared = usize::from(LittleEndian::read_u16(&buf[2..4]));
    let actual = buf.len() - PACKET_OVERHEAD;
    if declared != actual {
        return Err(PacketError::Malformed(MalformedReason::LengthMismatch {
            declared,
            actual,
        }));
    }

    let cs_offset = buf.len() - 3;
    let received = LittleEndian::read_u16(&buf[cs_offset..cs_offset + 2]);
    let computed = checksum(&buf[..cs_offset]);
    if received != computed {
        return Err(PacketError::Corrupt { received, computed });
    }

    Ok(DecodedPacket {
        code: buf[1],
        payload: &buf[PACKET_HEADER_LEN..cs_offset],
    })
}

/// Total frame length announced by a partial buffer, once its header is present.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < PACKET_HEADER_LEN {
        return None;
    }
    Some(usize::from(LittleEndian::read_u16(&buf[2..4])) + PACKET_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_dfu_packet() {
        let packet = encode(Command::EnterDfu, &[0x04, 0x03, 0x02, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(
            packet,
            [
                0x01, 0x38, 0x06, 0x00, 0x04, 0x03, 0x02, 0x01, 0x00, 0x00, 0xB7, 0xFF, 0x17
            ]
        );
    }

    #[test]
    fn test_empty_payload() {
        let packet = encode(Command::ExitDfu, &[]).unwrap();
        assert_eq!(packet.len(), PACKET_OVERHEAD);
        assert_eq!(&packet[..4], &[0x01, 0x3B, 0x00, 0x00]);
        assert_eq!(packet[6], END_OF_PACKET);
        let decoded = decode(&packet).unwrap();
        assert_eq!(decoded.code, 0x3B);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_known_response() {
        let resp = [
            0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01, 0xF2, 0xFF,
            0x17,
        ];
        let decoded = decode(&resp).unwrap();
        assert_eq!(decoded.status(), StatusCode::Success);
        assert_eq!(decoded.payload, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01]);
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        for len in [0usize, 1, 20, 256, 4096, MAX_PAYLOAD_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let packet = encode_response(StatusCode::Success, &payload).unwrap();
            let decoded = decode(&packet).unwrap();
            assert_eq!(decoded.code, 0);
            assert_eq!(decoded.payload, payload.as_slice());
        }
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(Command::SendData, &payload),
            Err(PacketError::Encoding {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            decode(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x17]),
            Err(PacketError::Malformed(MalformedReason::TooShort { len: 6 }))
        ));
    }

    #[test]
    fn test_bad_delimiters() {
        let mut packet = encode_response(StatusCode::Success, &[1, 2, 3]).unwrap();
        let last = packet.len() - 1;
        packet[last] = 0x18;
        assert!(matches!(
            decode(&packet),
            Err(PacketError::Malformed(MalformedReason::BadDelimiters { .. }))
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut packet = encode_response(StatusCode::Success, &[1, 2, 3]).unwrap();
        packet[2] = 4;
        assert!(matches!(
            decode(&packet),
            Err(PacketError::Malformed(MalformedReason::LengthMismatch {
                declared: 4,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut packet = encode_response(StatusCode::Success, &[0xAA]).unwrap();
        packet[4] = 0xAB;
        assert!(matches!(decode(&packet), Err(PacketError::Corrupt { .. })));
    }

    #[test]
    fn test_single_bit_flips_never_accepted() {
        for len in [0usize, 1, 6, 20, 256] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 0xA5) as u8).collect();
            let packet = encode(Command::ProgramData, &payload).unwrap();
            assert_eq!(decode(&packet).unwrap().payload, &payload[..]);

            for byte in 0..packet.len() {
                for bit in 0..8 {
                    let mut flipped = packet.clone();
                    flipped[byte] ^= 1 << bit;
                    match decode(&flipped) {
                        Err(PacketError::Malformed(_)) | Err(PacketError::Corrupt { .. }) => {}
                        other => panic!("len {len} byte {byte} bit {bit}: {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_frame_len() {
        let packet = encode(Command::SendData, &[0u8; 10]).unwrap();
        assert_eq!(frame_len(&packet[..3]), None);
        assert_eq!(frame_len(&packet[..4]), Some(17));
    }
}
