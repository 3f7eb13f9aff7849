//! WebSocket adapters.
//!
//! A socket is split into a writer task that owns the sink and a reader task
//! that owns the stream; the returned [`Connection`] talks to both through
//! bounded queues. Ping/pong frames are handled by the socket libraries and
//! never surface as messages.

use std::borrow::Cow;
use std::fmt;

use axum::extract::ws::{
    CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket as AxumWebSocket,
};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{CloseFrame, Connection, Message, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{Result, TransportError};

/// Drive any message socket through a [`Connection`].
pub fn spawn_socket<S, M, E>(
    socket: S,
    decode: fn(M) -> Option<Message>,
    encode: fn(Message) -> M,
    capacity: usize,
) -> Connection
where
    S: Stream<Item = std::result::Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send,
    M: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<Message>(capacity);
    let closed = CancellationToken::new();
    let connection = Connection::from_channels(out_tx, in_rx, closed.clone());
    let id = connection.id();
    let (mut sink, mut stream) = socket.split();

    let writer_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                message = out_rx.recv() => message,
                _ = writer_closed.cancelled() => None,
            };
            let Some(message) = next else { break };
            let is_close = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(encode(message)).await {
                debug!(connection = %id, error = %err, "websocket send failed");
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    let reader_closed = closed;
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = reader_closed.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(raw)) => {
                    let Some(message) = decode(raw) else { continue };
                    let is_close = matches!(message, Message::Close(_));
                    if in_tx.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(connection = %id, error = %err, "websocket receive failed");
                    break;
                }
                None => break,
            }
        }
        reader_closed.cancel();
        debug!(connection = %id, "websocket reader finished");
    });

    connection
}

/// Adopt a server-side socket upgraded by axum.
pub fn from_axum(socket: AxumWebSocket) -> Connection {
    spawn_socket(socket, decode_axum, encode_axum, DEFAULT_CHANNEL_CAPACITY)
}

/// Adopt a tokio-tungstenite stream (client side).
pub fn from_tungstenite<S>(stream: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_socket(
        stream,
        decode_tungstenite,
        encode_tungstenite,
        DEFAULT_CHANNEL_CAPACITY,
    )
}

/// Open a client WebSocket to `url` (e.g. `ws://127.0.0.1:9404/relay`).
pub async fn connect(url: &str) -> Result<Connection> {
    let (stream, _response) =
        tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| TransportError::Connect {
                url: url.to_string(),
                message: err.to_string(),
            })?;
    debug!(url, "websocket connected");
    Ok(from_tungstenite(stream))
}

fn decode_axum(message: AxumMessage) -> Option<Message> {
    match message {
        AxumMessage::Text(text) => Some(Message::Text(text)),
        AxumMessage::Binary(data) => Some(Message::Binary(Bytes::from(data))),
        AxumMessage::Close(frame) => Some(Message::Close(
            frame.map(|frame| CloseFrame::new(frame.code, frame.reason.into_owned())),
        )),
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => None,
    }
}

fn encode_axum(message: Message) -> AxumMessage {
    match message {
        Message::Text(text) => AxumMessage::Text(text),
        Message::Binary(data) => AxumMessage::Binary(data.to_vec()),
        Message::Close(frame) => AxumMessage::Close(frame.map(|frame| AxumCloseFrame {
            code: frame.code,
            reason: Cow::Owned(frame.reason),
        })),
    }
}

fn decode_tungstenite(message: WsMessage) -> Option<Message> {
    match message {
        WsMessage::Text(text) => Some(Message::Text(text)),
        WsMessage::Binary(data) => Some(Message::Binary(Bytes::from(data))),
        WsMessage::Close(frame) => Some(Message::Close(frame.map(|frame| {
            CloseFrame::new(u16::from(frame.code), frame.reason.into_owned())
        }))),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
    }
}

fn encode_tungstenite(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text),
        Message::Binary(data) => WsMessage::Binary(data.to_vec()),
        Message::Close(frame) => WsMessage::Close(frame.map(|frame| WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: Cow::Owned(frame.reason),
        })),
    }
}
