//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::{ChannelId, Notification, Transport, TransportError};
use crate::protocol::packet::{decode, encode_response, frame_len};
use crate::protocol::{Command, DEFAULT_WRITE_FRAGMENT_LEN, StatusCode};

/// Answers a reassembled command with `(status, payload)`, or stays silent.
type Responder = Box<dyn Fn(Command, &[u8]) -> Option<(StatusCode, Vec<u8>)> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory transport.
///
/// Fragments written by the session are captured and reassembled into whole
/// packets; replies come from a scripted queue or from a responder closure.
pub struct MockTransport {
    /// Notifications returned on receive.
    notifications: Arc<Mutex<VecDeque<Notification>>>,
    /// Captured fragments.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Captured whole packets.
    packets: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Bytes of a packet still being written.
    partial: Mutex<Vec<u8>>,
    responder: Option<Responder>,
    max_write_len: usize,
    channel: ChannelId,
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub const DEFAULT_CHANNEL: u16 = 0x000B;

    pub fn new() -> Self {
        Self {
            notifications: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            packets: Arc::new(Mutex::new(Vec::new())),
            partial: Mutex::new(Vec::new()),
            responder: None,
            max_write_len: DEFAULT_WRITE_FRAGMENT_LEN,
            channel: ChannelId::from(Self::DEFAULT_CHANNEL),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Answer every acknowledged command through `responder`.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(Command, &[u8]) -> Option<(StatusCode, Vec<u8>)> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    /// Queue a notification to be returned on the next receive.
    pub fn queue_notification(&self, notification: Notification) {
        lock(&self.notifications).push_back(notification);
    }

    /// Queue raw bytes on the session's own channel.
    pub fn queue_raw(&self, data: &[u8]) {
        self.queue_notification(Notification {
            channel: self.channel,
            data: data.to_vec(),
        });
    }

    /// Queue a well-formed response packet.
    pub fn queue_response(&self, status: StatusCode, payload: &[u8]) {
        if let Ok(packet) = encode_response(status, payload) {
            self.queue_raw(&packet);
        }
    }

    /// Get all captured fragments.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Get all captured packets, reassembled from fragments.
    pub fn get_packets(&self) -> Vec<Vec<u8>> {
        lock(&self.packets).clone()
    }

    /// Commands of the captured packets, in order.
    pub fn sent_commands(&self) -> Vec<Command> {
        lock(&self.packets)
            .iter()
            .filter_map(|p| p.get(1).copied().and_then(Command::from_byte))
            .collect()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    fn reassemble(&self, fragment: &[u8]) {
        let mut partial = lock(&self.partial);
        partial.extend_from_slice(fragment);

        while let Some(len) = frame_len(&partial) {
            if partial.len() < len {
                break;
            }
            let packet: Vec<u8> = partial.drain(..len).collect();
            self.respond(&packet);
            lock(&self.packets).push(packet);
        }
    }

    fn respond(&self, packet: &[u8]) {
        let Some(responder) = &self.responder else {
            return;
        };
        let Ok(decoded) = decode(packet) else {
            return;
        };
        let Some(command) = Command::from_byte(decoded.code) else {
            return;
        };
        if !command.expects_response() {
            return;
        }
        if let Some((status, payload)) = responder(command, decoded.payload) {
            self.queue_response(status, &payload);
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, fragment: &[u8]) -> Result<(), TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        if fragment.len() > self.max_write_len {
            return Err(TransportError::WriteFailed(format!(
                "fragment of {} bytes exceeds {}",
                fragment.len(),
                self.max_write_len
            )));
        }
        lock(&self.write_log).push(fragment.to_vec());
        self.reassemble(fragment);
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    fn recv_notification(
        &self,
        _timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        Ok(lock(&self.notifications).pop_front())
    }

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }
}
