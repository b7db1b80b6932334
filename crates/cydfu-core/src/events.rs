//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow an update without
//! tight coupling to the protocol logic.

use std::fmt;

use crate::state::UpdateState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Step of the update an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Enter,
    Metadata,
    /// Zero-based row index out of `total` rows when the image was counted
    /// up front. The address is unknown when the row itself failed to parse.
    Row {
        index: usize,
        total: Option<usize>,
        address: Option<u32>,
    },
    Verify,
    Exit,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Enter => write!(f, "enter DFU"),
            UpdatePhase::Metadata => write!(f, "set application metadata"),
            UpdatePhase::Row {
                index,
                total,
                address,
            } => {
                write!(f, "row {}", index + 1)?;
                if let Some(total) = total {
                    write!(f, " of {total}")?;
                }
                if let Some(address) = address {
                    write!(f, " (0x{address:08X})")?;
                }
                Ok(())
            }
            UpdatePhase::Verify => write!(f, "verify application"),
            UpdatePhase::Exit => write!(f, "exit DFU"),
        }
    }
}

/// Events emitted during an update.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// State machine moved.
    PhaseChanged { from: UpdateState, to: UpdateState },
    /// enterDFU answered with the target's identity.
    DeviceIdentified {
        jtag_id: u32,
        device_revision: u8,
        sdk_version: u32,
    },
    /// A row is about to be streamed.
    RowStarted {
        index: usize,
        total: Option<usize>,
        address: u32,
        len: usize,
    },
    /// Bytes programmed against the application length.
    Progress { current: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { phase: UpdatePhase, message: String },
    /// Fragment written or notification received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Update verified and session closed.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::DeviceIdentified {
                jtag_id,
                device_revision,
                sdk_version,
            } => {
                tracing::info!(
                    jtag_id = %format!("0x{:08X}", jtag_id),
                    device_revision = %format!("0x{:02X}", device_revision),
                    sdk_version = %format!("0x{:08X}", sdk_version),
                    "Entered DFU"
                );
            }
            DfuEvent::RowStarted {
                index,
                total,
                address,
                len,
            } => {
                tracing::debug!(
                    row = index,
                    total = ?total,
                    address = %format!("0x{:08X}", address),
                    len,
                    "Row"
                );
            }
            DfuEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(progress = %format!("{}%", pct.min(100)), current, total, "Progress");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { phase, message } => {
                tracing::error!(phase = %phase, "Error: {}", message);
            }
            DfuEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "BLE packet");
            }
            DfuEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(UpdatePhase::Enter.to_string(), "enter DFU");
        assert_eq!(
            UpdatePhase::Row {
                index: 4,
                total: Some(12),
                address: Some(0x1000_0200)
            }
            .to_string(),
            "row 5 of 12 (0x10000200)"
        );
        assert_eq!(
            UpdatePhase::Row {
                index: 4,
                total: None,
                address: Some(0x1000_0200)
            }
            .to_string(),
            "row 5 (0x10000200)"
        );
        assert_eq!(
            UpdatePhase::Row {
                index: 0,
                total: Some(3),
                address: None
            }
            .to_string(),
            "row 1 of 3"
        );
    }
}
