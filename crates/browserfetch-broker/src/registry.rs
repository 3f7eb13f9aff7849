//! Host registry: which live connection answers for which host name.
//!
//! A host is either `Unclaimed` (possibly with callers queued on it) or
//! `Claimed` by exactly one live connection. Every check-then-mutate
//! sequence runs under one lock, so a registration can never race a release
//! into a claim held by a dead connection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use browserfetch_transport::{ConnectionId, MessageSender};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::BrokerError;
use crate::status::{HostState, HostStatus};

/// How an endpoint reaches the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// A browser tab connected to this broker.
    Tab,
    /// A sibling broker that relays to its own tabs (or to the primary).
    Relay,
}

/// A connection able to serve requests for a host.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub sender: MessageSender,
    pub kind: EndpointKind,
}

impl Endpoint {
    pub fn tab(sender: MessageSender) -> Self {
        Self {
            sender,
            kind: EndpointKind::Tab,
        }
    }

    pub fn relay(sender: MessageSender) -> Self {
        Self {
            sender,
            kind: EndpointKind::Relay,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.sender.id()
    }

    fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Registration refused: the host already has a live owner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a host with the name `{host}` is already registered")]
pub struct DuplicateHost {
    pub host: String,
    /// The connection that keeps the claim.
    pub owner: ConnectionId,
}

impl From<DuplicateHost> for BrokerError {
    fn from(err: DuplicateHost) -> Self {
        BrokerError::DuplicateHost(err.host)
    }
}

struct Waiter {
    tx: oneshot::Sender<Endpoint>,
    /// Whether the relay upstream may answer for this waiter.
    allow_fallback: bool,
}

/// One host name. Callers queue while `claim` is empty or dead; only
/// [`Registry::release`] and friends clear a claim.
#[derive(Default)]
struct HostEntry {
    claim: Option<Endpoint>,
    waiters: Vec<Waiter>,
}

impl HostEntry {
    fn live_claim(&self) -> Option<&Endpoint> {
        self.claim.as_ref().filter(|endpoint| endpoint.is_live())
    }

    /// Nothing claims the host and nobody waits for it.
    fn is_idle(&mut self) -> bool {
        self.waiters.retain(|waiter| !waiter.tx.is_closed());
        self.claim.is_none() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct State {
    hosts: HashMap<String, HostEntry>,
    /// Relay upstream; answers for every unclaimed host while set.
    fallback: Option<Endpoint>,
}

enum Lookup {
    Ready(Endpoint),
    Wait(oneshot::Receiver<Endpoint>),
}

/// A queued lookup. Dropping it, e.g. when the caller times out, forgets
/// the host entry if nothing else needs it.
struct Waiting<'a> {
    registry: &'a Registry,
    host: &'a str,
    rx: Option<oneshot::Receiver<Endpoint>>,
}

impl Waiting<'_> {
    async fn endpoint(&mut self) -> Option<Endpoint> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.registry.forget_if_idle(self.host);
    }
}

/// Maps host names to the connection serving them.
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `host` for `endpoint` and wake everyone waiting on it.
    ///
    /// A live incumbent always wins; the caller must close the rejected
    /// connection. A claim held by a connection that has already closed is
    /// taken over.
    pub fn register(&self, host: &str, endpoint: Endpoint) -> Result<(), DuplicateHost> {
        let mut state = self.lock();
        let entry = state.hosts.entry(host.to_string()).or_default();

        if let Some(current) = &entry.claim {
            if current.is_live() {
                return Err(DuplicateHost {
                    host: host.to_string(),
                    owner: current.id(),
                });
            }
            debug!(host, stale = %current.id(), "replacing dead claim");
        }

        entry.claim = Some(endpoint.clone());
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.tx.send(endpoint.clone());
        }
        Ok(())
    }

    /// Wait until some connection can serve `host`.
    ///
    /// While a relay upstream is set, unclaimed hosts resolve to it. The
    /// caller bounds the wait with its own timeout.
    pub async fn resolve(&self, host: &str) -> Endpoint {
        self.resolve_with(host, true).await
    }

    /// Like [`resolve`](Self::resolve), but only local claims answer.
    pub async fn resolve_local(&self, host: &str) -> Endpoint {
        self.resolve_with(host, false).await
    }

    pub(crate) async fn resolve_with(&self, host: &str, allow_fallback: bool) -> Endpoint {
        loop {
            match self.lookup(host, allow_fallback) {
                Lookup::Ready(endpoint) => return endpoint,
                Lookup::Wait(rx) => {
                    let mut waiting = Waiting {
                        registry: self,
                        host,
                        rx: Some(rx),
                    };
                    if let Some(endpoint) = waiting.endpoint().await {
                        if endpoint.is_live() {
                            return endpoint;
                        }
                    }
                }
            }
        }
    }

    fn lookup(&self, host: &str, allow_fallback: bool) -> Lookup {
        let mut guard = self.lock();
        let state = &mut *guard;
        let fallback = state
            .fallback
            .clone()
            .filter(|endpoint| allow_fallback && endpoint.is_live());
        let entry = state.hosts.entry(host.to_string()).or_default();

        // A dead claim stays in place until its session releases it.
        if let Some(endpoint) = entry.live_claim() {
            return Lookup::Ready(endpoint.clone());
        }
        if let Some(endpoint) = fallback {
            return Lookup::Ready(endpoint);
        }
        entry.waiters.retain(|waiter| !waiter.tx.is_closed());
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(Waiter { tx, allow_fallback });
        Lookup::Wait(rx)
    }

    fn forget_if_idle(&self, host: &str) {
        let mut state = self.lock();
        if state.hosts.get_mut(host).is_some_and(HostEntry::is_idle) {
            state.hosts.remove(host);
        }
    }

    /// Un-claim `host` if, and only if, `connection` still owns it.
    /// Callers queued on the host keep waiting.
    pub fn release(&self, host: &str, connection: ConnectionId) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.hosts.get_mut(host) else {
            return false;
        };
        let owned = entry
            .claim
            .as_ref()
            .is_some_and(|endpoint| endpoint.id() == connection);
        if owned {
            entry.claim = None;
            if entry.is_idle() {
                state.hosts.remove(host);
            }
        }
        owned
    }

    /// Un-claim every host owned by `connection`, e.g. a relay link that
    /// went away.
    pub fn release_all(&self, connection: ConnectionId) -> Vec<String> {
        let mut state = self.lock();
        let mut released = Vec::new();
        state.hosts.retain(|host, entry| {
            if entry
                .claim
                .as_ref()
                .is_some_and(|endpoint| endpoint.id() == connection)
            {
                entry.claim = None;
                released.push(host.clone());
            }
            !entry.is_idle()
        });
        released.sort();
        released
    }

    /// Set or clear the relay upstream.
    ///
    /// Setting it hands the upstream to every queued caller that accepts it.
    /// Clearing it leaves queued callers waiting for a local claim.
    pub fn set_fallback(&self, fallback: Option<Endpoint>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.fallback = fallback.clone();

        let Some(endpoint) = fallback else { return };
        for entry in state.hosts.values_mut() {
            let (ready, queued): (Vec<_>, Vec<_>) = entry
                .waiters
                .drain(..)
                .partition(|waiter| waiter.allow_fallback);
            entry.waiters = queued;
            for waiter in ready {
                let _ = waiter.tx.send(endpoint.clone());
            }
        }
    }

    /// Return every host to `Unclaimed`, keeping queued callers queued.
    ///
    /// Returns the displaced claims so their connections can be closed.
    pub fn reset(&self) -> Vec<(String, Endpoint)> {
        let mut state = self.lock();
        let mut displaced = Vec::new();
        state.hosts.retain(|host, entry| {
            if let Some(endpoint) = entry.claim.take() {
                displaced.push((host.clone(), endpoint));
            }
            !entry.is_idle()
        });
        displaced
    }

    /// Hosts claimed by live, directly connected tabs.
    pub fn claimed_tabs(&self) -> Vec<String> {
        let state = self.lock();
        let mut hosts: Vec<String> = state
            .hosts
            .iter()
            .filter_map(|(host, entry)| match entry.live_claim() {
                Some(endpoint) if endpoint.kind == EndpointKind::Tab => Some(host.clone()),
                _ => None,
            })
            .collect();
        hosts.sort();
        hosts
    }

    /// The endpoint currently claiming `host`, if any.
    pub fn claimant(&self, host: &str) -> Option<Endpoint> {
        self.lock()
            .hosts
            .get(host)
            .and_then(|entry| entry.claim.clone())
    }

    pub fn has_fallback(&self) -> bool {
        self.lock().fallback.is_some()
    }

    /// Number of host names with a claim or a queued caller.
    pub fn len(&self) -> usize {
        self.lock().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view for the status page. Drops entries nobody waits on.
    pub fn snapshot(&self) -> Vec<HostStatus> {
        let mut state = self.lock();
        state.hosts.retain(|_, entry| !entry.is_idle());

        let mut hosts: Vec<HostStatus> = state
            .hosts
            .iter()
            .map(|(host, entry)| match &entry.claim {
                Some(endpoint) => HostStatus {
                    host: host.clone(),
                    state: HostState::Claimed,
                    connection: Some(endpoint.id().to_string()),
                    kind: Some(endpoint.kind),
                    waiters: entry.waiters.len(),
                },
                None => HostStatus {
                    host: host.clone(),
                    state: HostState::Unclaimed,
                    connection: None,
                    kind: None,
                    waiters: entry.waiters.len(),
                },
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use browserfetch_transport::{pair, CloseFrame, Connection};

    use super::*;

    // The returned connection is the browser's end of the link.
    fn tab() -> (Endpoint, Connection) {
        let (local, remote) = pair();
        (Endpoint::tab(local.sender().clone()), remote)
    }

    #[tokio::test]
    async fn register_then_resolve() {
        let registry = Registry::new();
        let (endpoint, _conn) = tab();
        let id = endpoint.id();

        registry.register("example.com", endpoint).unwrap();
        assert_eq!(registry.resolve("example.com").await.id(), id);
        assert_eq!(registry.claimant("example.com").map(|e| e.id()), Some(id));
    }

    #[tokio::test]
    async fn resolve_waits_for_registration() {
        let registry = Arc::new(Registry::new());
        let waiting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("late.example").await.id() })
        };
        tokio::task::yield_now().await;

        let (endpoint, _conn) = tab();
        let id = endpoint.id();
        registry.register("late.example", endpoint).unwrap();
        assert_eq!(waiting.await.unwrap(), id);
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_incumbent() {
        let registry = Registry::new();
        let (first, _c1) = tab();
        let (second, _c2) = tab();
        let first_id = first.id();

        registry.register("y", first).unwrap();
        let err = registry.register("y", second).unwrap_err();
        assert_eq!(err.owner, first_id);
        assert_eq!(
            err.to_string(),
            "a host with the name `y` is already registered"
        );
        assert_eq!(registry.resolve("y").await.id(), first_id);
    }

    #[tokio::test]
    async fn stale_release_does_not_unclaim_newer_connection() {
        let registry = Registry::new();
        let (old, old_conn) = tab();
        let old_id = old.id();
        registry.register("h", old).unwrap();

        old_conn.close(Some(CloseFrame::normal("reload")));
        let (new, _new_conn) = tab();
        let new_id = new.id();
        // The dead claim is taken over before the old session released it.
        registry.register("h", new).unwrap();

        assert!(!registry.release("h", old_id));
        assert_eq!(registry.claimant("h").map(|e| e.id()), Some(new_id));
        assert!(registry.release("h", new_id));
        assert!(registry.claimant("h").is_none());
    }

    #[tokio::test]
    async fn release_all_drops_only_that_connections_hosts() {
        let registry = Registry::new();
        let (link, _cl) = pair();
        let link_id = link.id();
        registry
            .register("b.example", Endpoint::relay(link.sender().clone()))
            .unwrap();
        registry
            .register("a.example", Endpoint::relay(link.sender().clone()))
            .unwrap();
        let (t, _ct) = tab();
        registry.register("c.example", t).unwrap();

        assert_eq!(
            registry.release_all(link_id),
            vec!["a.example".to_string(), "b.example".to_string()]
        );
        assert!(registry.claimant("a.example").is_none());
        assert!(registry.claimant("c.example").is_some());
    }

    #[tokio::test]
    async fn fallback_answers_unclaimed_hosts_but_not_local_lookups() {
        let registry = Arc::new(Registry::new());
        let local_waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve_local("x").await.id() })
        };
        let any_waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("x").await.id() })
        };
        tokio::task::yield_now().await;

        let (link, link_conn) = pair();
        let upstream = Endpoint::relay(link.sender().clone());
        let upstream_id = upstream.id();
        registry.set_fallback(Some(upstream));
        assert_eq!(any_waiter.await.unwrap(), upstream_id);

        // Clearing the fallback re-arms; the local waiter still waits for a tab.
        registry.set_fallback(None);
        drop(link_conn);
        let (endpoint, _conn) = tab();
        let tab_id = endpoint.id();
        registry.register("x", endpoint).unwrap();
        assert_eq!(local_waiter.await.unwrap(), tab_id);
    }

    #[tokio::test]
    async fn reset_unclaims_everything_and_keeps_waiters() {
        let registry = Arc::new(Registry::new());
        let (a, _ca) = tab();
        let a_id = a.id();
        registry.register("a", a).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve_local("b").await.id() })
        };
        tokio::task::yield_now().await;

        let displaced = registry.reset();
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].0, "a");
        assert_eq!(displaced[0].1.id(), a_id);
        assert!(registry.claimant("a").is_none());

        let (b, _cb) = tab();
        let b_id = b.id();
        registry.register("b", b).unwrap();
        assert_eq!(waiter.await.unwrap(), b_id);
    }

    #[tokio::test]
    async fn dead_claims_are_not_resolved() {
        let registry = Arc::new(Registry::new());
        let (endpoint, conn) = tab();
        registry.register("d", endpoint).unwrap();
        conn.close(None);

        let waiting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("d").await.id() })
        };
        let result = tokio::time::timeout(Duration::from_millis(50), waiting).await;
        assert!(result.is_err(), "resolve must not return a closed connection");
    }

    #[tokio::test]
    async fn lookup_leaves_dead_claim_for_its_owner_to_release() {
        let registry = Registry::new();
        let (endpoint, conn) = tab();
        let id = endpoint.id();
        registry.register("gone", endpoint).unwrap();
        conn.close(None);

        let lookup = tokio::time::timeout(Duration::from_millis(20), registry.resolve("gone")).await;
        assert!(lookup.is_err());

        assert_eq!(registry.claimant("gone").map(|e| e.id()), Some(id));
        assert!(registry.release("gone", id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn abandoned_lookups_do_not_accumulate() {
        let registry = Registry::new();
        for n in 0..50 {
            let host = format!("never-{n}.example");
            let lookup =
                tokio::time::timeout(Duration::from_millis(1), registry.resolve_local(&host)).await;
            assert!(lookup.is_err());
        }
        assert!(registry.is_empty());

        // Releasing the last claim of a host nobody waits on forgets it too.
        let (endpoint, _conn) = tab();
        let id = endpoint.id();
        registry.register("brief", endpoint).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.release("brief", id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn snapshot_and_claimed_tabs() {
        let registry = Arc::new(Registry::new());
        let (t, _ct) = tab();
        registry.register("tab.example", t).unwrap();
        let (link, _cl) = pair();
        registry
            .register("relayed.example", Endpoint::relay(link.sender().clone()))
            .unwrap();
        let _pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve_local("waiting.example").await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.claimed_tabs(), vec!["tab.example".to_string()]);

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(
            names,
            vec!["relayed.example", "tab.example", "waiting.example"]
        );
        assert_eq!(snapshot[0].kind, Some(EndpointKind::Relay));
        assert_eq!(snapshot[2].state, HostState::Unclaimed);
        assert_eq!(snapshot[2].waiters, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_has_exactly_one_winner() {
        for round in 0..20 {
            let registry = Arc::new(Registry::new());
            let host = format!("race-{round}");
            let mut links = Vec::new();
            let mut tasks = Vec::new();
            for _ in 0..16 {
                let (endpoint, conn) = tab();
                links.push(conn);
                let registry = Arc::clone(&registry);
                let host = host.clone();
                tasks.push(tokio::spawn(async move {
                    let id = endpoint.id();
                    registry.register(&host, endpoint).map(|()| id)
                }));
            }

            let mut winners = Vec::new();
            let mut losers = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(id) => winners.push(id),
                    Err(err) => {
                        assert_eq!(err.host, host);
                        losers += 1;
                    }
                }
            }
            assert_eq!(winners.len(), 1, "round {round}");
            assert_eq!(losers, 15);
            assert_eq!(
                registry.claimant(&host).map(|e| e.id()),
                Some(winners[0])
            );
        }
    }
}
