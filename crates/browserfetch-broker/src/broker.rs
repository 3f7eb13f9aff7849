use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use browserfetch_frame::FrameConfig;
use browserfetch_transport::{
    CloseFrame, Connection, ConnectionId, Message, MessageSender, TransportError,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{self, BridgeState};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::net::{Network, TcpNetwork};
use crate::pending::PendingCalls;
use crate::protocol::{Action, RelayControl, Reply, Request, CLOSE_NORMAL, CLOSE_REGISTRY_RESET};
use crate::registry::{Endpoint, EndpointKind, Registry};
use crate::request::{EvaluateRequest, FetchRequest, FetchResponse};
use crate::session;
use crate::status::StatusReport;

/// Which side of the election this broker is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Not yet elected, or re-electing after losing the primary.
    Starting,
    /// Owns the listening endpoint.
    Primary,
    /// Forwards to the primary over the relay link.
    Relay,
}

pub(crate) struct Shared {
    config: BrokerConfig,
    frame: FrameConfig,
    registry: Registry,
    pending: Arc<PendingCalls>,
    role: watch::Sender<Role>,
    shutdown: CancellationToken,
    upstream: Mutex<Option<MessageSender>>,
    connections: Mutex<HashMap<ConnectionId, MessageSender>>,
}

/// Request broker: the handle callers use to reach browser tabs.
///
/// Cheap to clone; all clones share one registry and one pending-call table.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Shared>,
}

impl Broker {
    /// Create a broker that is not attached to any network.
    ///
    /// Tabs and relay links can still be attached directly.
    pub fn new(config: BrokerConfig) -> Self {
        let frame = config.frame_config();
        let (role, _) = watch::channel(Role::Starting);
        Self {
            inner: Arc::new(Shared {
                config,
                frame,
                registry: Registry::new(),
                pending: PendingCalls::new(),
                role,
                shutdown: CancellationToken::new(),
                upstream: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a broker on the configured TCP endpoint.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let network = Arc::new(TcpNetwork::from_config(&config));
        Self::start_with(config, network).await
    }

    /// Start a broker, electing its role through `network`.
    ///
    /// Binding becomes primary; an address already in use becomes a relay.
    /// Any other bind error is returned.
    pub async fn start_with(config: BrokerConfig, network: Arc<dyn Network>) -> Result<Self> {
        let broker = Self::new(config);
        let initial = match network.bind().await {
            Ok(acceptor) => {
                broker.set_role(Role::Primary);
                BridgeState::Primary(acceptor)
            }
            Err(err) if err.is_addr_in_use() => {
                info!(addr = %broker.config().addr(), "endpoint in use; connecting as relay");
                BridgeState::RelayConnecting
            }
            Err(err) => return Err(err.into()),
        };
        tokio::spawn(bridge::run(broker.clone(), network, initial));
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.inner.pending
    }

    pub(crate) fn frame_config(&self) -> &FrameConfig {
        &self.inner.frame
    }

    pub fn role(&self) -> Role {
        *self.inner.role.borrow()
    }

    pub(crate) fn set_role(&self, role: Role) {
        let previous = self.inner.role.send_replace(role);
        if previous != role {
            info!(?previous, ?role, "role changed");
        }
    }

    /// Wait until the broker reaches `role`. Returns `false` on shutdown.
    pub async fn wait_for_role(&self, role: Role) -> bool {
        let mut rx = self.inner.role.subscribe();
        tokio::select! {
            result = rx.wait_for(|current| *current == role) => result.is_ok(),
            _ = self.inner.shutdown.cancelled() => false,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Evaluate `code` in the tab registered as `host`.
    pub async fn evaluate(&self, code: &str, host: &str, timeout: Option<Duration>) -> Result<Value> {
        let mut request = EvaluateRequest::new(code, host);
        request.timeout = timeout;
        self.evaluate_with(request).await
    }

    pub async fn evaluate_with(&self, request: EvaluateRequest) -> Result<Value> {
        let (host, action, timeout) = request.into_action();
        let reply = self.call(&host, action, None, timeout).await?;
        Ok(reply.result())
    }

    /// Run the browser's `fetch` in the tab serving the request's host.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let (host, action, body, timeout) = request.into_parts()?;
        let reply = self.call(&host, action, body, timeout).await?;
        FetchResponse::from_reply(reply)
    }

    /// Send `action` to whoever serves `host` and wait for the reply.
    ///
    /// One deadline covers waiting for the host and waiting for the reply.
    /// A reply carrying `error` becomes [`BrokerError::Browser`].
    pub async fn call(
        &self,
        host: &str,
        action: Action,
        body: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        if self.is_shut_down() {
            return Err(BrokerError::Shutdown);
        }
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let deadline = Instant::now() + timeout;

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(BrokerError::Shutdown),
            result = self.dispatch(host, action, body, timeout, deadline, true) => result,
        }?;

        if reply.timed_out() {
            return Err(BrokerError::Timeout(timeout));
        }
        if let Some(message) = reply.error() {
            return Err(BrokerError::Browser(message));
        }
        Ok(reply)
    }

    /// Route one request and return the raw reply.
    pub(crate) async fn dispatch(
        &self,
        host: &str,
        action: Action,
        body: Option<Bytes>,
        timeout: Duration,
        deadline: Instant,
        allow_fallback: bool,
    ) -> Result<Reply> {
        let pending = &self.inner.pending;
        let ticket = pending.begin();

        loop {
            let endpoint = tokio::time::timeout_at(
                deadline,
                self.inner.registry.resolve_with(host, allow_fallback),
            )
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?;
            pending.attach(ticket.id(), endpoint.id());

            let request = Request {
                call_id: ticket.id(),
                timeout: deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs_f64(),
                host: (endpoint.kind == EndpointKind::Relay).then(|| host.to_string()),
                action: action.clone(),
            };
            let wire = self.inner.frame.encode(&request.to_frame(body.clone())?)?;
            debug!(
                call_id = %ticket.id(),
                host,
                action = request.action.name(),
                connection = %endpoint.id(),
                "sending request"
            );
            match endpoint.sender.send(Message::Binary(wire)).await {
                Ok(()) => break,
                // Dropped relay link: resolve again within the same deadline.
                Err(TransportError::Closed) if endpoint.kind == EndpointKind::Relay => {
                    debug!(call_id = %ticket.id(), host, "relay link closed; resolving again");
                }
                Err(TransportError::Closed) => {
                    return Err(BrokerError::ConnectionClosed(format!(
                        "connection for `{host}` closed before the request was sent"
                    )))
                }
                Err(other) => return Err(BrokerError::Transport(other)),
            }
        }

        pending
            .await_reply(&ticket, deadline)
            .await
            .map_err(|err| match err {
                BrokerError::Timeout(_) => BrokerError::Timeout(timeout),
                other => other,
            })
    }

    /// Serve a browser tab connection (handshake, registration, replies).
    pub fn attach(&self, connection: Connection) -> JoinHandle<()> {
        tokio::spawn(session::serve_tab(self.clone(), connection))
    }

    /// Serve a relay link opened by a sibling broker.
    pub fn attach_relay(&self, connection: Connection) -> JoinHandle<()> {
        tokio::spawn(session::serve_relay(self.clone(), connection))
    }

    /// Remember a live connection so shutdown can close it. A connection
    /// tracked after shutdown is closed right away.
    pub(crate) fn track(&self, sender: MessageSender) {
        self.lock_connections().insert(sender.id(), sender.clone());
        if self.is_shut_down() {
            sender.close(Some(CloseFrame::new(CLOSE_NORMAL, "broker shutting down")));
        }
    }

    pub(crate) fn untrack(&self, id: ConnectionId) {
        self.lock_connections().remove(&id);
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, MessageSender>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_upstream(&self) -> MutexGuard<'_, Option<MessageSender>> {
        self.inner
            .upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn upstream(&self) -> Option<MessageSender> {
        self.lock_upstream().clone()
    }

    /// Install or remove the relay upstream, keeping the registry fallback
    /// in step.
    pub(crate) fn set_upstream(&self, upstream: Option<MessageSender>) {
        *self.lock_upstream() = upstream.clone();
        self.inner
            .registry
            .set_fallback(upstream.map(Endpoint::relay));
    }

    /// Forget the relay upstream and everything learned while relaying.
    ///
    /// Tabs displaced by the reset are closed with
    /// [`CLOSE_REGISTRY_RESET`] so they reconnect against whoever wins the
    /// next election. Queued callers stay queued; calls already sent
    /// upstream run into their own deadlines.
    pub(crate) fn on_upstream_lost(&self) {
        self.set_upstream(None);
        let displaced = self.inner.registry.reset();
        for (host, endpoint) in &displaced {
            if endpoint.kind == EndpointKind::Tab {
                debug!(%host, connection = %endpoint.id(), "closing displaced tab");
                endpoint.sender.close(Some(CloseFrame::new(
                    CLOSE_REGISTRY_RESET,
                    "registry reset, reconnect",
                )));
            }
        }
        self.set_role(Role::Starting);
        warn!(
            error = %BrokerError::UpstreamLost,
            displaced = displaced.len(),
            pending = self.inner.pending.len(),
            "re-electing"
        );
    }

    /// Tell the primary about a relay-side control event, if relaying.
    pub(crate) async fn notify_upstream(&self, control: RelayControl) {
        let Some(upstream) = self.upstream() else {
            return;
        };
        let wire = match control
            .to_frame()
            .and_then(|frame| Ok(self.inner.frame.encode(&frame)?))
        {
            Ok(wire) => wire,
            Err(err) => {
                debug!(error = %err, "failed to encode relay control");
                return;
            }
        };
        if let Err(err) = upstream.send(Message::Binary(wire)).await {
            debug!(error = %err, ?control, "failed to notify upstream");
        }
    }

    /// Snapshot of role, hosts and pending calls.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            role: self.role(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hosts: self.inner.registry.snapshot(),
            pending: self.inner.pending.snapshot(),
        }
    }

    /// Cancel every pending call and close every connection.
    ///
    /// Does not wait for in-flight work to drain. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let cancelled = self.inner.pending.cancel_all();

        let connections: Vec<MessageSender> =
            self.lock_connections().drain().map(|(_, sender)| sender).collect();
        let closed = connections.len();
        for sender in connections {
            sender.close(Some(CloseFrame::new(CLOSE_NORMAL, "broker shutting down")));
        }
        if let Some(upstream) = self.lock_upstream().take() {
            upstream.close(Some(CloseFrame::new(CLOSE_NORMAL, "broker shutting down")));
        }
        info!(cancelled, closed, "broker shut down");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("addr", &self.inner.config.addr())
            .field("role", &self.role())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
