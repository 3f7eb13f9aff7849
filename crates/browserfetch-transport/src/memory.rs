//! In-process connections.
//!
//! Both ends of a pair share one close token: closing either end delivers a
//! [`Message::Close`] to the other and then fails every further send.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, DEFAULT_CHANNEL_CAPACITY};

/// Create two connected in-memory connections.
pub fn pair() -> (Connection, Connection) {
    pair_with_capacity(DEFAULT_CHANNEL_CAPACITY)
}

/// Create two connected in-memory connections with an explicit queue size.
pub fn pair_with_capacity(capacity: usize) -> (Connection, Connection) {
    let (left_tx, right_rx) = mpsc::channel(capacity);
    let (right_tx, left_rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();

    let left = Connection::from_channels(left_tx, left_rx, closed.clone());
    let right = Connection::from_channels(right_tx, right_rx, closed);
    (left, right)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::connection::{CloseFrame, Message};
    use crate::error::TransportError;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (mut left, mut right) = pair();

        left.send(Message::Text("3 example.com".to_string()))
            .await
            .unwrap();
        right
            .send(Message::Binary(Bytes::from_static(b"{}")))
            .await
            .unwrap();

        assert_eq!(
            right.recv().await,
            Some(Message::Text("3 example.com".to_string()))
        );
        assert_eq!(
            left.recv().await,
            Some(Message::Binary(Bytes::from_static(b"{}")))
        );
        assert_ne!(left.id(), right.id());
    }

    #[tokio::test]
    async fn close_reaches_peer_with_reason() {
        let (left, mut right) = pair();

        left.close(Some(CloseFrame::new(4001, "duplicate")));

        assert_eq!(
            right.recv().await,
            Some(Message::Close(Some(CloseFrame::new(4001, "duplicate"))))
        );
        assert_eq!(right.recv().await, None);
        assert!(matches!(
            right.send(Message::Text("x".to_string())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn dropping_one_end_ends_the_other() {
        let (left, mut right) = pair();
        drop(left);
        assert_eq!(right.recv().await, None);
    }

    #[tokio::test]
    async fn split_halves_work_independently() {
        let (left, right) = pair();
        let (left_tx, left_rx) = left.split();
        let (_right_tx, mut right_rx) = right.split();

        let sender = left_tx.clone();
        tokio::spawn(async move {
            sender
                .send(Message::Text("from clone".to_string()))
                .await
                .unwrap();
        });

        assert_eq!(
            right_rx.recv().await,
            Some(Message::Text("from clone".to_string()))
        );
        assert_eq!(left_tx.id(), left_rx.id());
    }
}
