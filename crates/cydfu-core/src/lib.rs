//! cydfu-core: host side of the Cypress/Infineon bootloader DFU protocol.
//!
//! Reprograms a device's flash over a notification-based transport (BLE in
//! practice) from a `.cyacd2` image.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Command and status codes, packet framing, checksums
//! - **Transport**: Fragment write / notification receive abstraction (mock, observable)
//! - **Session**: One method per bootloader command
//! - **Payload**: cyacd2 image parsing with lazy row iteration
//! - **State**: Update state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Update**: End-to-end orchestration
//! - **Config**: TOML configuration file
//!
//! # Example
//!
//! ```no_run
//! use cydfu_core::{Cyacd2Image, DfuSession, MockTransport, UpdateConfig, UpdateOrchestrator};
//!
//! let mut image = Cyacd2Image::open("app.cyacd2").expect("bad image");
//! let session = DfuSession::new(MockTransport::new());
//! let mut update = UpdateOrchestrator::new(session, UpdateConfig::default());
//! update.run(&mut image).expect("update failed");
//! ```

pub mod config;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod update;

// Re-exports for convenience
pub use config::DfuConfig;
pub use events::{
    DfuEvent, DfuObserver, LogLevel, NullObserver, PacketDirection, TracingObserver, UpdatePhase,
};
pub use payload::{AppDescriptor, Cyacd2Image, Header, ImageError, Row};
pub use protocol::{Command, PacketError, StatusCode};
pub use session::{DeviceInfo, DfuError, DfuSession, SessionConfig};
pub use state::{UpdateContext, UpdateState};
pub use transport::{
    ChannelId, MockTransport, Notification, ObservableTransport, Transport, TransportError,
};
pub use update::{UpdateConfig, UpdateError, UpdateErrorKind, UpdateOrchestrator, UpdateReport};
