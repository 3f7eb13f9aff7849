//! Message-oriented connection abstraction.
//!
//! A [`Connection`] carries discrete text/binary messages in both directions
//! and reports closure with an optional code and reason. Two backends exist:
//! - in-memory pairs ([`memory::pair`]) for tests and in-process wiring
//! - WebSocket adapters ([`websocket`]) over axum and tokio-tungstenite
//!
//! This is the lowest layer of browserfetch. The broker never sees sockets,
//! only connections.

pub mod connection;
pub mod error;
pub mod memory;
pub mod websocket;

pub use connection::{
    CloseFrame, Connection, ConnectionId, Message, MessageReceiver, MessageSender,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use error::{Result, TransportError};
pub use memory::pair;
