use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// Default number of messages buffered in each direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one connection.
///
/// Two handles refer to the same live connection iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Close code and human-readable reason sent when a connection is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, reason)
    }
}

/// A discrete message carried by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

/// Sending half of a connection. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct MessageSender {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl MessageSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for delivery.
    ///
    /// Fails with [`TransportError::Closed`] once either side closed the link.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close the link, telling the peer why. Idempotent.
    pub fn close(&self, frame: Option<CloseFrame>) {
        if self.closed.is_cancelled() {
            return;
        }
        // A full queue only loses the reason; cancellation still tears the link down.
        let _ = self.tx.try_send(Message::Close(frame));
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of a connection. Owned by exactly one receive loop.
pub struct MessageReceiver {
    id: ConnectionId,
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl MessageReceiver {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receive the next message.
    ///
    /// Messages already queued are delivered before closure is reported.
    /// Returns `None` once the link is closed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }
}

impl fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("id", &self.id)
            .finish()
    }
}

/// A bidirectional, message-oriented connection.
#[derive(Debug)]
pub struct Connection {
    sender: MessageSender,
    receiver: MessageReceiver,
}

impl Connection {
    /// Assemble a connection from an outbound queue, an inbound queue and
    /// the link's shared close token.
    pub fn from_channels(
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<Message>,
        closed: CancellationToken,
    ) -> Self {
        let id = ConnectionId::next();
        Self {
            sender: MessageSender {
                id,
                tx: outbound,
                closed: closed.clone(),
            },
            receiver: MessageReceiver {
                id,
                rx: inbound,
                closed,
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.sender.id
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn close(&self, frame: Option<CloseFrame>) {
        self.sender.close(frame)
    }

    pub fn split(self) -> (MessageSender, MessageReceiver) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("conn-{}", a.as_u64()));
    }

    #[tokio::test]
    async fn queued_messages_drain_before_close_is_reported() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let mut conn = Connection::from_channels(tx.clone(), rx, token.clone());

        tx.send(Message::Text("first".to_string())).await.unwrap();
        token.cancel();

        assert_eq!(conn.recv().await, Some(Message::Text("first".to_string())));
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (tx, _rx_far) = mpsc::channel(4);
        let (_tx_far, rx) = mpsc::channel(4);
        let conn = Connection::from_channels(tx, rx, CancellationToken::new());

        conn.close(Some(CloseFrame::normal("bye")));
        assert!(conn.sender().is_closed());
        let err = conn.send(Message::Text("late".to_string())).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
