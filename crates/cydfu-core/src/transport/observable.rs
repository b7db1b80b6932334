//! Transport wrapper that reports traffic to an observer.

use std::sync::Arc;
use std::time::Duration;

use super::traits::{ChannelId, Notification, Transport, TransportError};
use crate::events::{DfuEvent, DfuObserver, PacketDirection};

/// Bytes of each packet copied into `DfuEvent::Packet`.
const PACKET_PREVIEW_LEN: usize = 32;

/// Forwards to `inner` and emits a `Packet` event for every fragment written
/// and every notification received.
pub struct ObservableTransport<T: Transport, O: DfuObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: Transport, O: DfuObserver> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&DfuEvent::Packet {
            direction,
            length: data.len(),
            data: Some(data.iter().take(PACKET_PREVIEW_LEN).copied().collect()),
        });
    }
}

impl<T: Transport, O: DfuObserver> Transport for ObservableTransport<T, O> {
    fn write(&self, fragment: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(fragment);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, fragment);
        }
        res
    }

    fn max_write_len(&self) -> usize {
        self.inner.max_write_len()
    }

    fn recv_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        let res = self.inner.recv_notification(timeout);
        if let Ok(Some(notification)) = &res {
            self.emit(PacketDirection::Rx, &notification.data);
        }
        res
    }

    fn channel(&self) -> ChannelId {
        self.inner.channel()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::StatusCode;
    use crate::transport::MockTransport;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(PacketDirection, usize)>>);

    impl DfuObserver for Recorder {
        fn on_event(&self, event: &DfuEvent) {
            if let DfuEvent::Packet {
                direction, length, ..
            } = event
            {
                self.0.lock().unwrap().push((*direction, *length));
            }
        }
    }

    #[test]
    fn test_reports_both_directions() {
        let mock = MockTransport::new();
        mock.queue_response(StatusCode::Success, &[]);
        let recorder = Arc::new(Recorder::default());
        let transport = ObservableTransport::new(mock, recorder.clone());

        transport.write_fragmented(&[0u8; 25], 64).unwrap();
        transport
            .recv_notification(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        // Nothing queued: no event.
        assert!(
            transport
                .recv_notification(Duration::from_millis(10))
                .unwrap()
                .is_none()
        );

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (PacketDirection::Tx, 20),
                (PacketDirection::Tx, 5),
                (PacketDirection::Rx, 7),
            ]
        );
    }
}
