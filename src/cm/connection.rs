//! Per-Identifier Connection Records

use crate::protocol::state::State;
use crate::protocol::types::{ConnectionId, Role, ServiceId};

/// Snapshot of one identifier, for inspection and logging.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: State,
    pub role: Option<Role>,
    pub service_id: Option<ServiceId>,
    pub peer: Option<ConnectionId>,
    pub remote_qpn: Option<u32>,
    pub starting_psn: Option<u32>,
}

/// Mutable record for one live identifier. Guarded by its own mutex so
/// identifiers progress independently; no global lock spans two records.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) state: State,
    pub(crate) role: Option<Role>,
    pub(crate) service_id: Option<ServiceId>,
    pub(crate) peer: Option<ConnectionId>,
    /// Passive side: the listener that minted this identifier, kept while
    /// the incoming request is still pending.
    pub(crate) listener: Option<ConnectionId>,
    /// Listener side: pending-request cap and current pending count.
    pub(crate) backlog: usize,
    pub(crate) pending: usize,
    pub(crate) remote_qpn: Option<u32>,
    pub(crate) starting_psn: Option<u32>,
    /// Bumped on every transition. Timers capture it at arm time so a
    /// stale timer can tell the identifier has since moved on.
    pub(crate) epoch: u64,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: State::Idle,
            role: None,
            service_id: None,
            peer: None,
            listener: None,
            backlog: 0,
            pending: 0,
            remote_qpn: None,
            starting_psn: None,
            epoch: 0,
        }
    }

    pub(crate) fn transition(&mut self, next: State) {
        self.state = next;
        self.epoch += 1;
    }

    /// Recycle the identifier back to `Idle`, clearing everything the
    /// previous exchange negotiated. The identifier number is kept.
    pub(crate) fn reset(&mut self) {
        self.transition(State::Idle);
        self.role = None;
        self.service_id = None;
        self.peer = None;
        self.listener = None;
        self.backlog = 0;
        self.pending = 0;
        self.remote_qpn = None;
        self.starting_psn = None;
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            role: self.role,
            service_id: self.service_id,
            peer: self.peer,
            remote_qpn: self.remote_qpn,
            starting_psn: self.starting_psn,
        }
    }
}
