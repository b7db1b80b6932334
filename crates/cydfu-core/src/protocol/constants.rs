//! Protocol constants for the bootloader DFU host.
//!
//! Values follow the Cypress/Infineon DFU host command set (AN213924).

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// First byte of every command and response packet.
pub const START_OF_PACKET: u8 = 0x01;

/// Last byte of every command and response packet.
pub const END_OF_PACKET: u8 = 0x17;

/// Start(1) + code(1) + length(2) + checksum(2) + end(1).
pub const PACKET_OVERHEAD: usize = 7;

/// Bytes preceding the payload (start, code, length).
pub const PACKET_HEADER_LEN: usize = 4;

/// Largest payload the u16 length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ============================================================================
// Row streaming
// ============================================================================

/// Row address (u32) + row checksum (u32) prefixed to programData / verifyData.
pub const ROW_PREFIX_LEN: usize = 8;

/// Historical chunk size used when streaming a row.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Largest chunk that still fits programData's length field after the row prefix.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_LEN - ROW_PREFIX_LEN;

/// Highest row offset accepted by getMetadata.
pub const MAX_METADATA_ROW_OFFSET: u16 = 511;

// ============================================================================
// Transport
// ============================================================================

/// Default write fragment size (BLE ATT payload with the default MTU).
pub const DEFAULT_WRITE_FRAGMENT_LEN: usize = 20;

/// Bootloader GATT service.
pub const BOOTLOADER_SERVICE_UUID: &str = "00060000-F8CE-11E4-ABF4-0002A5D5C51B";

/// Timeout for commands the device answers after a flash operation.
pub const LONG_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for everything else.
pub const SHORT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
