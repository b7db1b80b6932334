//! Transport layer abstraction.
//!
//! Defines the `Transport` trait the DFU session talks through: fragment writes
//! on one side, a stream of channel-tagged notifications on the other.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Failed to enable notifications: {0}")]
    NotifyFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical endpoint a notification was delivered on (GATT handle or
/// characteristic UUID, depending on the backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u128);

impl From<u16> for ChannelId {
    fn from(handle: u16) -> Self {
        Self(u128::from(handle))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 <= u128::from(u16::MAX) {
            write!(f, "0x{:04X}", self.0)
        } else {
            write!(f, "{:032x}", self.0)
        }
    }
}

/// One asynchronous notification from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: ChannelId,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(channel: impl Into<ChannelId>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
        }
    }
}

/// Abstract DFU transport.
///
/// The protocol is strictly request/response with no request identifier, so an
/// implementation must deliver notifications in order and one per response.
pub trait Transport: Send + Sync {
    /// Write one fragment (at most `max_write_len()` bytes) to the command channel.
    fn write(&self, fragment: &[u8]) -> Result<(), TransportError>;

    /// Largest fragment `write` accepts.
    fn max_write_len(&self) -> usize;

    /// Block until the next notification arrives or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout.
    fn recv_notification(&self, timeout: Duration)
    -> Result<Option<Notification>, TransportError>;

    /// The channel the DFU command characteristic notifies on.
    fn channel(&self) -> ChannelId;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Write a whole buffer in fragments of at most `fragment_len` bytes,
    /// capped by `max_write_len()`. Returns the number of fragments written.
    fn write_fragmented(&self, data: &[u8], fragment_len: usize) -> Result<usize, TransportError> {
        let max = fragment_len.min(self.max_write_len()).max(1);
        let mut count = 0;
        for fragment in data.chunks(max) {
            trace!(data = %hex::encode(fragment), "Fragment");
            self.write(fragment)?;
            count += 1;
        }
        Ok(count)
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn write(&self, fragment: &[u8]) -> Result<(), TransportError> {
        (**self).write(fragment)
    }

    fn max_write_len(&self) -> usize {
        (**self).max_write_len()
    }

    fn recv_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        (**self).recv_notification(timeout)
    }

    fn channel(&self) -> ChannelId {
        (**self).channel()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display() {
        assert_eq!(ChannelId::from(0x000Bu16).to_string(), "0x000B");
        let uuid_like = ChannelId(0x00060001_f8ce_11e4_abf4_0002a5d5c51b);
        assert_eq!(uuid_like.to_string(), "00060001f8ce11e4abf40002a5d5c51b");
    }
}
