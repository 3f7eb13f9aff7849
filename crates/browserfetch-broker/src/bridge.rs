//! Primary/relay election.
//!
//! Ownership of one endpoint is the only arbitration: whoever binds it is
//! primary, everyone else relays to the primary. A relay that loses its
//! upstream goes back to [`BridgeState::Starting`] and tries to bind again.
//!
//! ```text
//! Starting ──bind ok──▶ Primary
//!    │  ▲
//!    │  └──connect failed / upstream lost──┐
//!    └──addr in use──▶ RelayConnecting ──▶ RelayActive
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use browserfetch_transport::Connection;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Role};
use crate::handshake::handshake_client;
use crate::net::{Acceptor, Incoming, Network};
use crate::protocol::RelayControl;
use crate::session::{serve_link, LinkSide};

/// Election state. Every transition goes through [`step`].
pub(crate) enum BridgeState {
    Starting,
    Primary(Box<dyn Acceptor>),
    RelayConnecting,
    RelayActive(Connection),
    Stopped,
}

impl fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Starting => f.write_str("Starting"),
            BridgeState::Primary(_) => f.write_str("Primary"),
            BridgeState::RelayConnecting => f.write_str("RelayConnecting"),
            BridgeState::RelayActive(link) => write!(f, "RelayActive({})", link.id()),
            BridgeState::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Drive the election until the broker shuts down.
pub(crate) async fn run(broker: Broker, network: Arc<dyn Network>, initial: BridgeState) {
    let mut state = initial;
    loop {
        if matches!(state, BridgeState::Stopped) {
            break;
        }
        debug!(?state, "bridge step");
        state = step(&broker, network.as_ref(), state).await;
    }
    debug!("bridge stopped");
}

/// Run one state to its next state.
pub(crate) async fn step(broker: &Broker, network: &dyn Network, state: BridgeState) -> BridgeState {
    if broker.is_shut_down() {
        return BridgeState::Stopped;
    }
    match state {
        BridgeState::Starting => match network.bind().await {
            Ok(acceptor) => BridgeState::Primary(acceptor),
            Err(err) if err.is_addr_in_use() => BridgeState::RelayConnecting,
            Err(err) => {
                warn!(error = %err, "bind failed; retrying");
                pause(broker, broker.config().relay_retry_delay).await
            }
        },
        BridgeState::Primary(acceptor) => serve_primary(broker, acceptor).await,
        BridgeState::RelayConnecting => match connect(broker, network).await {
            Ok(link) => BridgeState::RelayActive(link),
            Err(err) => {
                debug!(error = %err, "relay connect failed; re-electing");
                pause(broker, broker.config().relay_retry_delay).await
            }
        },
        BridgeState::RelayActive(link) => serve_relay(broker, link).await,
        BridgeState::Stopped => BridgeState::Stopped,
    }
}

async fn pause(broker: &Broker, delay: Duration) -> BridgeState {
    tokio::select! {
        _ = broker.shutdown_token().cancelled() => BridgeState::Stopped,
        _ = tokio::time::sleep(delay) => BridgeState::Starting,
    }
}

async fn serve_primary(broker: &Broker, mut acceptor: Box<dyn Acceptor>) -> BridgeState {
    broker.set_role(Role::Primary);
    loop {
        let incoming = tokio::select! {
            _ = broker.shutdown_token().cancelled() => return BridgeState::Stopped,
            incoming = acceptor.accept() => incoming,
        };
        match incoming {
            Some(Incoming::Tab(connection)) => {
                broker.attach(connection);
            }
            Some(Incoming::Relay(connection)) => {
                broker.attach_relay(connection);
            }
            Some(Incoming::Status(reply)) => {
                let _ = reply.send(broker.status());
            }
            None => {
                warn!("endpoint stopped serving; re-electing");
                broker.set_role(Role::Starting);
                return BridgeState::Starting;
            }
        }
    }
}

async fn connect(broker: &Broker, network: &dyn Network) -> crate::error::Result<Connection> {
    let link = network.connect_relay().await?;
    handshake_client(link.sender(), &broker.config().handshake).await?;
    Ok(link)
}

async fn serve_relay(broker: &Broker, link: Connection) -> BridgeState {
    let (sender, mut receiver) = link.split();
    broker.set_upstream(Some(sender.clone()));
    broker.set_role(Role::Relay);

    let hosts = broker.registry().claimed_tabs();
    info!(upstream = %sender.id(), hosts = hosts.len(), "relaying to primary");
    for host in hosts {
        broker.notify_upstream(RelayControl::Announce(host)).await;
    }

    let reason = tokio::select! {
        _ = broker.shutdown_token().cancelled() => None,
        reason = serve_link(broker, &sender, &mut receiver, LinkSide::Upstream) => Some(reason),
    };
    sender.close(None);
    match reason {
        None => BridgeState::Stopped,
        Some(reason) => {
            info!(upstream = %sender.id(), %reason, "upstream link ended");
            broker.on_upstream_lost();
            BridgeState::Starting
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use browserfetch_transport::{Result, TransportError};

    use super::*;
    use crate::config::BrokerConfig;
    use crate::net::MemoryNetwork;

    struct FailingNetwork {
        binds: AtomicUsize,
    }

    #[async_trait]
    impl Network for FailingNetwork {
        async fn bind(&self) -> Result<Box<dyn Acceptor>> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Bind {
                addr: "test".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        }

        async fn connect_relay(&self) -> Result<Connection> {
            Err(TransportError::Closed)
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            relay_retry_delay: Duration::from_millis(10),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn starting_binds_free_endpoint() {
        let network = MemoryNetwork::new();
        let broker = Broker::new(config());
        let next = step(&broker, &network, BridgeState::Starting).await;
        assert!(matches!(next, BridgeState::Primary(_)));
        assert!(network.is_bound());
    }

    #[tokio::test]
    async fn starting_on_taken_endpoint_goes_relay() {
        let network = MemoryNetwork::new();
        let _guard = network.occupy().unwrap();
        let broker = Broker::new(config());
        let next = step(&broker, &network, BridgeState::Starting).await;
        assert!(matches!(next, BridgeState::RelayConnecting));

        // Nobody serves the occupied endpoint, so connecting falls back.
        let next = step(&broker, &network, next).await;
        assert!(matches!(next, BridgeState::Starting));
    }

    #[tokio::test]
    async fn other_bind_errors_retry() {
        let network = FailingNetwork {
            binds: AtomicUsize::new(0),
        };
        let broker = Broker::new(config());
        let next = step(&broker, &network, BridgeState::Starting).await;
        assert!(matches!(next, BridgeState::Starting));
        assert_eq!(network.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_every_state() {
        let network = MemoryNetwork::new();
        let broker = Broker::new(config());
        broker.shutdown();
        for state in [BridgeState::Starting, BridgeState::RelayConnecting] {
            assert!(matches!(
                step(&broker, &network, state).await,
                BridgeState::Stopped
            ));
        }
        assert!(!network.is_bound());
    }

    #[tokio::test]
    async fn relay_promotes_itself_when_upstream_goes_away() {
        let network = MemoryNetwork::new();
        let primary = Broker::new(config());
        let Ok(acceptor) = network.bind().await else {
            panic!("bind failed");
        };
        let primary_task = tokio::spawn(run(
            primary.clone(),
            Arc::new(network.clone()),
            BridgeState::Primary(acceptor),
        ));

        let relay = Broker::new(config());
        let relay_task = tokio::spawn(run(
            relay.clone(),
            Arc::new(network.clone()),
            BridgeState::RelayConnecting,
        ));
        assert!(relay.wait_for_role(Role::Relay).await);

        primary.shutdown();
        primary_task.await.unwrap();
        assert!(relay.wait_for_role(Role::Primary).await);
        assert!(network.is_bound());

        relay.shutdown();
        relay_task.await.unwrap();
    }
}
