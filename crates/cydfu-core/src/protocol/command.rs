//! DFU command vocabulary.

use std::fmt;
use std::time::Duration;

use super::constants::{LONG_RESPONSE_TIMEOUT, SHORT_RESPONSE_TIMEOUT};

/// Host-to-device command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Verify Application (0x31).
    VerifyApplication = 0x31,
    /// Sync DFU (0x35), unacknowledged.
    SyncDfu = 0x35,
    /// Send Data (0x37).
    SendData = 0x37,
    /// Enter DFU (0x38).
    EnterDfu = 0x38,
    /// Exit DFU (0x3B), unacknowledged.
    ExitDfu = 0x3B,
    /// Get Metadata (0x3C).
    GetMetadata = 0x3C,
    /// Erase Data (0x44).
    EraseData = 0x44,
    /// Send Data Without Response (0x47), unacknowledged.
    SendDataNoResponse = 0x47,
    /// Program Data (0x49).
    ProgramData = 0x49,
    /// Verify Data (0x4A).
    VerifyData = 0x4A,
    /// Set Application Metadata (0x4C).
    SetApplicationMetadata = 0x4C,
    /// Set EI Vector (0x4D). Reserved, never transmitted.
    SetEiVector = 0x4D,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::VerifyApplication,
        Command::SyncDfu,
        Command::SendData,
        Command::EnterDfu,
        Command::ExitDfu,
        Command::GetMetadata,
        Command::EraseData,
        Command::SendDataNoResponse,
        Command::ProgramData,
        Command::VerifyData,
        Command::SetApplicationMetadata,
        Command::SetEiVector,
    ];

    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_byte() == byte)
    }

    /// Whether the device sends a response packet for this command.
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Command::SyncDfu | Command::ExitDfu | Command::SendDataNoResponse | Command::SetEiVector
        )
    }

    /// Response deadline used when the session has no override.
    pub fn default_timeout(self) -> Duration {
        match self {
            Command::EnterDfu
            | Command::SendData
            | Command::ProgramData
            | Command::VerifyApplication
            | Command::SetApplicationMetadata => LONG_RESPONSE_TIMEOUT,
            _ => SHORT_RESPONSE_TIMEOUT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::VerifyApplication => "VerifyApplication",
            Command::SyncDfu => "SyncDfu",
            Command::SendData => "SendData",
            Command::EnterDfu => "EnterDfu",
            Command::ExitDfu => "ExitDfu",
            Command::GetMetadata => "GetMetadata",
            Command::EraseData => "EraseData",
            Command::SendDataNoResponse => "SendDataNoResponse",
            Command::ProgramData => "ProgramData",
            Command::VerifyData => "VerifyData",
            Command::SetApplicationMetadata => "SetApplicationMetadata",
            Command::SetEiVector => "SetEiVector",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.as_byte())
    }
}
