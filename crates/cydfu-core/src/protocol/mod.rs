//! Protocol module - DFU command set, status codes and packet framing.

pub mod checksum;
pub mod command;
pub mod constants;
pub mod packet;
pub mod status;

pub use checksum::{checksum, row_checksum};
pub use command::Command;
pub use constants::*;
pub use packet::{DecodedPacket, MalformedReason, PacketError, decode, encode, encode_response};
pub use status::StatusCode;
