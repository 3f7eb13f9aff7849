//! Request broker for browserfetch.
//!
//! Callers ask for JavaScript evaluation or a `fetch` inside a browser tab
//! identified by its host name. The broker finds the tab's connection (or
//! waits for it), correlates the reply with the call, and enforces one
//! deadline per call.
//!
//! Any number of brokers can run on one machine. The one that binds the
//! well-known endpoint is primary; the others relay through it and take
//! over the endpoint when the primary goes away.

mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod handshake;
pub mod net;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod request;
mod server;
mod session;
pub mod status;

pub use broker::{Broker, Role};
pub use config::{BrokerConfig, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use error::{BrokerError, Result};
pub use handshake::{HandshakeConfig, Hello, PROTOCOL_VERSION};
pub use net::{Acceptor, Incoming, MemoryNetwork, Network, PortGuard, TcpNetwork};
pub use pending::{CallState, CallTicket, PendingCalls};
pub use protocol::{
    Action, CallId, Envelope, RelayControl, Reply, Request, CLOSE_DUPLICATE_HOST, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR, CLOSE_REGISTRY_RESET,
};
pub use registry::{DuplicateHost, Endpoint, EndpointKind, Registry};
pub use request::{extract_host, EvaluateRequest, FetchRequest, FetchResponse};
pub use status::{HostState, HostStatus, PendingStatus, StatusReport};
