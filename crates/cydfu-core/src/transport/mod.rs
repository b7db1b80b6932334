//! Transport layer module.

pub mod mock;
pub mod observable;
pub mod traits;

pub use mock::MockTransport;
pub use observable::ObservableTransport;
pub use traits::{ChannelId, Notification, Transport, TransportError};
