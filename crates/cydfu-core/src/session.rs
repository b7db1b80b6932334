//! DFU session - one method per bootloader command.
//!
//! Every acknowledged command follows the same shape: encode, write in
//! fragments, wait for the next notification, decode, map the status byte.
//! The protocol carries no request id, so at most one command may be waiting
//! for a response at any time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result as AnyResult, bail};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::protocol::{
    Command, DEFAULT_WRITE_FRAGMENT_LEN, MAX_METADATA_ROW_OFFSET, PacketError, StatusCode, decode,
    encode,
};
use crate::transport::{ChannelId, Transport, TransportError};

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest fragment handed to the transport per write.
    pub write_fragment_len: usize,
    /// Response deadline for every command; `None` keeps the per-command defaults.
    pub timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_fragment_len: DEFAULT_WRITE_FRAGMENT_LEN,
            timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> AnyResult<()> {
        if self.write_fragment_len == 0 {
            bail!("session.write_fragment_len must be at least 1");
        }
        if self.timeout_ms == Some(0) {
            bail!("session.timeout_ms must be at least 1");
        }
        Ok(())
    }

    /// Deadline for `command`'s response.
    pub fn timeout_for(&self, command: Command) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| command.default_timeout())
    }
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No response to {command} within {timeout_ms} ms")]
    Timeout { command: Command, timeout_ms: u64 },

    #[error("Notification on channel {actual}, expected {expected}")]
    WrongChannel {
        expected: ChannelId,
        actual: ChannelId,
    },

    #[error("Another command is still awaiting its response")]
    SessionBusy,

    #[error("{command} rejected with status {status}")]
    Status { command: Command, status: StatusCode },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{command} response has {actual} bytes, expected {expected}")]
    ShortResponse {
        command: Command,
        expected: usize,
        actual: usize,
    },
}

impl DfuError {
    /// No notification arrived in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DfuError::Timeout { .. })
    }

    /// A response arrived but failed its checksum.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, DfuError::Packet(PacketError::Corrupt { .. }))
    }

    /// Status byte reported by the device, if this is a rejection.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DfuError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Identity returned by enterDFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub jtag_id: u32,
    pub device_revision: u8,
    pub sdk_version: u32,
}

impl DeviceInfo {
    const WIRE_LEN: usize = 8;

    fn parse(payload: &[u8]) -> Result<Self, DfuError> {
        if payload.len() < Self::WIRE_LEN {
            return Err(DfuError::ShortResponse {
                command: Command::EnterDfu,
                expected: Self::WIRE_LEN,
                actual: payload.len(),
            });
        }
        Ok(Self {
            jtag_id: LittleEndian::read_u32(&payload[0..4]),
            device_revision: payload[4],
            // Three bytes on the wire, placed above a zero low byte.
            sdk_version: LittleEndian::read_u24(&payload[5..8]) << 8,
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JTAG ID 0x{:08X}, revision 0x{:02X}, SDK 0x{:08X}",
            self.jtag_id, self.device_revision, self.sdk_version
        )
    }
}

/// Holds the request slot; releases it on drop, including on error paths.
struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Host side of a DFU session over one transport.
pub struct DfuSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    pending: AtomicBool,
}

impl<T: Transport> DfuSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            pending: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Start a session. The device may reject a product id it was not built for.
    pub fn enter_dfu(&self, product_id: u32) -> Result<DeviceInfo, DfuError> {
        let response = self.transact(Command::EnterDfu, &product_id.to_le_bytes())?;
        let info = DeviceInfo::parse(&response)?;
        debug!(%info, "Device identified");
        Ok(info)
    }

    pub fn sync_dfu(&self) -> Result<(), DfuError> {
        self.send_unacknowledged(Command::SyncDfu, &[])
    }

    /// End the session. The device resets without answering.
    pub fn exit_dfu(&self) -> Result<(), DfuError> {
        self.send_unacknowledged(Command::ExitDfu, &[])
    }

    /// Buffer an intermediate chunk of a row.
    pub fn send_data(&self, data: &[u8]) -> Result<(), DfuError> {
        self.transact(Command::SendData, data).map(drop)
    }

    pub fn send_data_no_response(&self, data: &[u8]) -> Result<(), DfuError> {
        self.send_unacknowledged(Command::SendDataNoResponse, data)
    }

    /// Commit the buffered chunks plus `data` as the row at `address`.
    ///
    /// `row_checksum` is the CRC-32C of the complete row, not of this chunk.
    pub fn program_data(&self, address: u32, row_checksum: u32, data: &[u8]) -> Result<(), DfuError> {
        let payload = row_payload(address, row_checksum, data);
        self.transact(Command::ProgramData, &payload).map(drop)
    }

    /// Compare the row at `address` against `data` without programming.
    pub fn verify_data(&self, address: u32, row_checksum: u32, data: &[u8]) -> Result<(), DfuError> {
        let payload = row_payload(address, row_checksum, data);
        self.transact(Command::VerifyData, &payload).map(drop)
    }

    pub fn erase_data(&self, address: u32) -> Result<(), DfuError> {
        self.transact(Command::EraseData, &address.to_le_bytes())
            .map(drop)
    }

    /// Ask the bootloader whether application `app_id` is valid.
    pub fn verify_application(&self, app_id: u8) -> Result<bool, DfuError> {
        let response = self.transact(Command::VerifyApplication, &[app_id])?;
        match response.first() {
            Some(&flag) => Ok(flag != 0),
            None => Err(DfuError::ShortResponse {
                command: Command::VerifyApplication,
                expected: 1,
                actual: 0,
            }),
        }
    }

    pub fn set_application_metadata(
        &self,
        app_id: u8,
        start_address: u32,
        length: u32,
    ) -> Result<(), DfuError> {
        let mut payload = [0u8; 9];
        payload[0] = app_id;
        LittleEndian::write_u32(&mut payload[1..5], start_address);
        LittleEndian::write_u32(&mut payload[5..9], length);
        self.transact(Command::SetApplicationMetadata, &payload)
            .map(drop)
    }

    /// Read the metadata rows `from_row..=to_row` (offsets 0 to 511).
    pub fn get_metadata(&self, from_row: u16, to_row: u16) -> Result<Vec<u8>, DfuError> {
        for (name, offset) in [("from", from_row), ("to", to_row)] {
            if offset > MAX_METADATA_ROW_OFFSET {
                return Err(DfuError::InvalidArgument(format!(
                    "{name} row offset {offset} exceeds {MAX_METADATA_ROW_OFFSET}"
                )));
            }
        }
        let mut payload = [0u8; 4];
        LittleEndian::write_u16(&mut payload[0..2], from_row);
        LittleEndian::write_u16(&mut payload[2..4], to_row);
        self.transact(Command::GetMetadata, &payload)
    }

    /// Reserved by the bootloader; nothing is transmitted.
    pub fn set_ei_vector(&self, vector: &[u8]) -> Result<(), DfuError> {
        debug!(len = vector.len(), "SetEiVector is not supported, ignoring");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Send `command` and return the payload of its successful response.
    pub fn transact(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>, DfuError> {
        self.transact_with_timeout(command, payload, self.config.timeout_for(command))
    }

    /// As [`transact`](Self::transact), with an explicit response deadline.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn transact_with_timeout(
        &self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError> {
        let _slot = self.acquire()?;
        self.send(command, payload)?;

        if !command.expects_response() {
            return Ok(Vec::new());
        }

        let notification = self
            .transport
            .recv_notification(timeout)?
            .ok_or_else(|| DfuError::Timeout {
                command,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?;

        let expected = self.transport.channel();
        if notification.channel != expected {
            return Err(DfuError::WrongChannel {
                expected,
                actual: notification.channel,
            });
        }

        let packet = decode(&notification.data)?;
        let status = packet.status();
        debug!(%command, %status, len = packet.payload.len(), "Response");
        if !status.is_success() {
            return Err(DfuError::Status { command, status });
        }
        Ok(packet.payload.to_vec())
    }

    /// Write a command the device never answers. The slot is held only while writing.
    fn send_unacknowledged(&self, command: Command, payload: &[u8]) -> Result<(), DfuError> {
        let _slot = self.acquire()?;
        self.send(command, payload)
    }

    fn acquire(&self) -> Result<SlotGuard<'_>, DfuError> {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DfuError::SessionBusy)?;
        Ok(SlotGuard(&self.pending))
    }

    fn send(&self, command: Command, payload: &[u8]) -> Result<(), DfuError> {
        let packet = encode(command, payload)?;
        if !self.transport.is_connected() {
            return Err(TransportError::Disconnected.into());
        }

        debug!(%command, len = packet.len(), "Sending");
        self.transport
            .write_fragmented(&packet, self.config.write_fragment_len)?;
        Ok(())
    }
}

fn row_payload(address: u32, row_checksum: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&address.to_le_bytes());
    payload.extend_from_slice(&row_checksum.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}
