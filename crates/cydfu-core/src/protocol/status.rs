//! Status codes carried in the second byte of every response packet.

use std::fmt;

/// Device-reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    VerifyError,
    LengthError,
    DataError,
    CommandError,
    ChecksumError,
    RowError,
    RowAccessError,
    UnknownCommandError,
    /// Any byte outside the documented set.
    Unrecognized(u8),
}

impl StatusCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Success,
            0x02 => Self::VerifyError,
            0x03 => Self::LengthError,
            0x04 => Self::DataError,
            0x05 => Self::CommandError,
            0x08 => Self::ChecksumError,
            0x0A => Self::RowError,
            0x0B => Self::RowAccessError,
            0x0F => Self::UnknownCommandError,
            other => Self::Unrecognized(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::VerifyError => 0x02,
            Self::LengthError => 0x03,
            Self::DataError => 0x04,
            Self::CommandError => 0x05,
            Self::ChecksumError => 0x08,
            Self::RowError => 0x0A,
            Self::RowAccessError => 0x0B,
            Self::UnknownCommandError => 0x0F,
            Self::Unrecognized(b) => b,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Human-readable meaning, as documented for the bootloader.
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::VerifyError => "verification of flash failed",
            Self::LengthError => "amount of data is outside the expected range",
            Self::DataError => "data is not of the proper form",
            Self::CommandError => "command is not recognized",
            Self::ChecksumError => "packet checksum does not match",
            Self::RowError => "row number is outside the valid range",
            Self::RowAccessError => "row cannot be accessed",
            Self::UnknownCommandError => "unknown error",
            Self::Unrecognized(_) => "undefined status code",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.as_byte(), self.description())
    }
}
