//! Pending-call table: correlates replies to the calls waiting on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use browserfetch_transport::ConnectionId;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::protocol::{CallId, Reply};
use crate::status::PendingStatus;

/// Reply slot of one call.
///
/// `resolve` is the only transition; a call resolves at most once.
#[derive(Debug)]
pub enum CallState {
    Pending,
    Resolved(Result<Reply>),
}

impl CallState {
    /// Store `outcome` if nothing has been stored yet.
    pub fn resolve(&mut self, outcome: Result<Reply>) -> bool {
        match self {
            CallState::Pending => {
                *self = CallState::Resolved(outcome);
                true
            }
            CallState::Resolved(_) => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CallState::Resolved(_))
    }

    fn into_outcome(self) -> Option<Result<Reply>> {
        match self {
            CallState::Pending => None,
            CallState::Resolved(outcome) => Some(outcome),
        }
    }
}

struct PendingEntry {
    state: CallState,
    notify: Arc<Notify>,
    /// Connection the request went out on, once known.
    connection: Option<ConnectionId>,
    deadline: Option<Instant>,
}

/// Handle to one pending call. Dropping it forgets the call, so a reply
/// arriving afterwards is dropped.
pub struct CallTicket {
    id: CallId,
    started: Instant,
    notify: Arc<Notify>,
    table: Arc<PendingCalls>,
}

impl CallTicket {
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Drop for CallTicket {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

impl std::fmt::Debug for CallTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTicket").field("id", &self.id).finish()
    }
}

/// In-flight calls keyed by [`CallId`].
pub struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<HashMap<CallId, PendingEntry>>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingEntry>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh call id with an empty reply slot.
    pub fn begin(self: &Arc<Self>) -> CallTicket {
        let id = CallId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let notify = Arc::new(Notify::new());
        self.lock().insert(
            id,
            PendingEntry {
                state: CallState::Pending,
                notify: Arc::clone(&notify),
                connection: None,
                deadline: None,
            },
        );
        CallTicket {
            id,
            started: Instant::now(),
            notify,
            table: Arc::clone(self),
        }
    }

    /// Record which connection the request for `id` was sent on.
    pub fn attach(&self, id: CallId, connection: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.connection = Some(connection);
        }
    }

    /// Wait for the reply to `ticket` until `deadline`.
    ///
    /// On timeout the entry is removed and [`BrokerError::Timeout`] returned.
    pub async fn await_reply(&self, ticket: &CallTicket, deadline: Instant) -> Result<Reply> {
        if let Some(entry) = self.lock().get_mut(&ticket.id) {
            entry.deadline = Some(deadline);
        }
        loop {
            if let Some(outcome) = self.take_resolved(ticket.id) {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, ticket.notify.notified())
                .await
                .is_err()
            {
                if let Some(outcome) = self.take_resolved(ticket.id) {
                    return outcome;
                }
                self.lock().remove(&ticket.id);
                debug!(call_id = %ticket.id, "call timed out");
                return Err(BrokerError::Timeout(
                    deadline.saturating_duration_since(ticket.started),
                ));
            }
        }
    }

    fn take_resolved(&self, id: CallId) -> Option<Result<Reply>> {
        let mut calls = self.lock();
        match calls.get(&id).map(|entry| entry.state.is_resolved()) {
            Some(true) => calls.remove(&id).and_then(|entry| entry.state.into_outcome()),
            Some(false) => None,
            None => Some(Err(BrokerError::Protocol(format!(
                "call {id} is no longer pending"
            )))),
        }
    }

    /// Hand `reply` to the call it names.
    ///
    /// Returns `false` (and drops the reply) when the id is unknown, timed
    /// out, or already answered.
    pub fn deliver(&self, reply: Reply) -> bool {
        let id = reply.call_id();
        self.resolve(id, Ok(reply))
    }

    fn resolve(&self, id: CallId, outcome: Result<Reply>) -> bool {
        let mut calls = self.lock();
        let Some(entry) = calls.get_mut(&id) else {
            return false;
        };
        if !entry.state.resolve(outcome) {
            return false;
        }
        entry.notify.notify_one();
        true
    }

    /// Fail every unanswered call sent on `connection`.
    pub fn fail_connection(&self, connection: ConnectionId, reason: &str) -> usize {
        self.fail_where(
            |entry| entry.connection == Some(connection),
            || BrokerError::ConnectionClosed(reason.to_string()),
        )
    }

    /// Fail every unanswered call with [`BrokerError::Shutdown`].
    pub fn cancel_all(&self) -> usize {
        self.fail_where(|_| true, || BrokerError::Shutdown)
    }

    fn fail_where(
        &self,
        predicate: impl Fn(&PendingEntry) -> bool,
        error: impl Fn() -> BrokerError,
    ) -> usize {
        let mut calls = self.lock();
        let mut failed = 0;
        for entry in calls.values_mut() {
            if predicate(entry) && entry.state.resolve(Err(error())) {
                entry.notify.notify_one();
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Read-only view for the status page, oldest call first.
    pub fn snapshot(&self) -> Vec<PendingStatus> {
        let now = Instant::now();
        let mut pending: Vec<PendingStatus> = self
            .lock()
            .iter()
            .map(|(id, entry)| PendingStatus {
                call_id: *id,
                connection: entry.connection.map(|c| c.to_string()),
                remaining_ms: entry.deadline.map(|deadline| {
                    u64::try_from(deadline.saturating_duration_since(now).as_millis())
                        .unwrap_or(u64::MAX)
                }),
                resolved: entry.state.is_resolved(),
            })
            .collect();
        pending.sort_by_key(|status| status.call_id);
        pending
    }
}
