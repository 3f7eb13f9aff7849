//! The bind/connect capability the election runs on.
//!
//! [`TcpNetwork`] is the real thing: an axum server on the well-known port.
//! [`MemoryNetwork`] stands in for it in tests, with a port that can be
//! taken and released on demand.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use browserfetch_transport::{
    pair, websocket, Connection, Result, TransportError, DEFAULT_CHANNEL_CAPACITY,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

use crate::config::BrokerConfig;
use crate::server;
use crate::status::StatusReport;

/// Something that arrived on the primary's endpoint.
pub enum Incoming {
    /// A browser tab.
    Tab(Connection),
    /// A sibling broker's relay link.
    Relay(Connection),
    /// A status page request.
    Status(oneshot::Sender<StatusReport>),
}

/// The accepting side of a bound endpoint. Dropping it releases the
/// endpoint.
#[async_trait]
pub trait Acceptor: Send {
    /// Next arrival, or `None` once the endpoint stopped serving.
    async fn accept(&mut self) -> Option<Incoming>;
}

/// Exclusive endpoint ownership plus the client side of a relay link.
#[async_trait]
pub trait Network: Send + Sync {
    /// Take the endpoint. Fails with an address-in-use
    /// [`TransportError::Bind`] while someone else holds it.
    async fn bind(&self) -> Result<Box<dyn Acceptor>>;

    /// Open a relay link to whoever holds the endpoint.
    async fn connect_relay(&self) -> Result<Connection>;
}

struct ChannelAcceptor {
    rx: mpsc::Receiver<Incoming>,
    _server: Option<DropGuard>,
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }
}

/// TCP/WebSocket endpoint at `host:port`.
#[derive(Debug, Clone)]
pub struct TcpNetwork {
    addr: String,
    relay_url: String,
    max_message_size: usize,
}

impl TcpNetwork {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            addr: config.addr(),
            relay_url: config.relay_url(),
            max_message_size: config.max_payload_size,
        }
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn bind(&self) -> Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.addr.clone(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "listening");

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        tokio::spawn(server::serve(
            listener,
            server::ServerState::new(tx, self.max_message_size),
            token.clone(),
        ));
        Ok(Box::new(ChannelAcceptor {
            rx,
            _server: Some(token.drop_guard()),
        }))
    }

    async fn connect_relay(&self) -> Result<Connection> {
        websocket::connect(&self.relay_url).await
    }
}

enum Port {
    Bound(mpsc::Sender<Incoming>),
    Occupied(Weak<()>),
}

impl Port {
    fn is_held(&self) -> bool {
        match self {
            Port::Bound(tx) => !tx.is_closed(),
            Port::Occupied(hold) => hold.strong_count() > 0,
        }
    }
}

/// Keeps a [`MemoryNetwork`] port taken until dropped.
#[derive(Debug)]
pub struct PortGuard {
    _hold: Arc<()>,
}

/// In-process endpoint shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    port: Arc<Mutex<Option<Port>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Port>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether anyone currently holds the port.
    pub fn is_bound(&self) -> bool {
        self.lock().as_ref().is_some_and(Port::is_held)
    }

    /// Take the port without serving it, as a foreign process would.
    pub fn occupy(&self) -> Option<PortGuard> {
        let mut port = self.lock();
        if port.as_ref().is_some_and(Port::is_held) {
            return None;
        }
        let hold = Arc::new(());
        *port = Some(Port::Occupied(Arc::downgrade(&hold)));
        Some(PortGuard { _hold: hold })
    }

    /// Connect as a browser tab would.
    pub async fn connect_tab(&self) -> Result<Connection> {
        self.deliver(Incoming::Tab).await
    }

    /// Ask the holder for its status page.
    pub async fn status(&self) -> Option<StatusReport> {
        let tx = self.server()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Incoming::Status(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    fn server(&self) -> Option<mpsc::Sender<Incoming>> {
        match self.lock().as_ref() {
            Some(Port::Bound(tx)) if !tx.is_closed() => Some(tx.clone()),
            _ => None,
        }
    }

    async fn deliver(&self, arrive: fn(Connection) -> Incoming) -> Result<Connection> {
        let tx = self.server().ok_or_else(refused)?;
        let (local, remote) = pair();
        tx.send(arrive(remote)).await.map_err(|_| refused())?;
        Ok(local)
    }

    fn try_bind(&self) -> Result<Box<dyn Acceptor>> {
        let mut port = self.lock();
        if port.as_ref().is_some_and(Port::is_held) {
            return Err(TransportError::Bind {
                addr: "memory".to_string(),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        *port = Some(Port::Bound(tx));
        Ok(Box::new(ChannelAcceptor { rx, _server: None }))
    }
}

fn refused() -> TransportError {
    TransportError::Connect {
        url: "memory".to_string(),
        message: "connection refused".to_string(),
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn bind(&self) -> Result<Box<dyn Acceptor>> {
        self.try_bind()
    }

    async fn connect_relay(&self) -> Result<Connection> {
        self.deliver(Incoming::Relay).await
    }
}
