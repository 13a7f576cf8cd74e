use bytes::Bytes;

use crate::error::TransportError;
use crate::pipeline::Transport;

/// Transport that queues writes on a bounded channel for an async socket
/// writer to drain. The capture loop never touches the socket itself.
pub struct ChannelTransport {
    tx: flume::Sender<Vec<Bytes>>,
}

impl ChannelTransport {
    /// `capacity` is the number of queued writes before the session backs off
    pub fn new(capacity: usize) -> (Self, flume::Receiver<Vec<Bytes>>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    fn send(&self, chunks: Vec<Bytes>) -> Result<(), TransportError> {
        self.tx.try_send(chunks).map_err(|e| match e {
            flume::TrySendError::Full(_) => TransportError::Full,
            flume::TrySendError::Disconnected(_) => TransportError::Disconnected,
        })
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        !self.tx.is_disconnected()
    }

    fn is_writable(&self) -> bool {
        !self.tx.is_full()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(vec![Bytes::copy_from_slice(bytes)])
    }

    fn write_part(&mut self, header: &[u8], body: &Bytes) -> Result<(), TransportError> {
        self.send(vec![
            Bytes::copy_from_slice(header),
            body.clone(),
            Bytes::from_static(b"\r\n"),
        ])
    }
}
