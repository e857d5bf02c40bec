use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::ServerMessage;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The client is not draining its queue fast enough.
    #[error("client queue is full")]
    Full,
    #[error("client connection is closed")]
    Closed,
}

/// Outbound side of one connected client. `send` must never block: a client that
/// cannot take a message right now fails the send and is dropped by the dispatcher.
pub trait ClientTransport: Send {
    fn send(&self, message: ServerMessage) -> Result<(), TransportError>;
}

/// Bounded queue drained by the client's socket writer task.
pub struct ChannelTransport {
    tx: mpsc::Sender<ServerMessage>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelTransport { tx }, rx)
    }
}

impl ClientTransport for ChannelTransport {
    fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
