//! Connection Manager Device
//!
//! The process-wide owned handle to the connection manager. Created once,
//! passed by reference to every operation, released when dropped. Owns the
//! identifier table, the service registry, the event stream, and the
//! timers driving request timeouts and TimeWait recycling.
//!
//! State-mutating operations are safe to call from any task while one
//! consumer drives `poll_event` in a loop; each identifier's record sits
//! behind its own mutex and no lock is held across a peer delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CmConfig;
use crate::error::{CmError, CmResult};
use crate::event::{CmEvent, CmEventKind, EventPool};
use crate::protocol::constants::{MAX_DREQ_PRIVATE_DATA, MAX_REJ_PRIVATE_DATA};
use crate::protocol::path::PathRecord;
use crate::protocol::state::{Message, Operation, State};
use crate::protocol::types::{ConnectionId, ReplyParams, RequestParams, Role, ServiceId};

use super::connection::{Connection, ConnectionInfo};
use super::service::ServiceRegistry;

type ConnTable = HashMap<ConnectionId, Arc<Mutex<Connection>>>;

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lookup(connections: &RwLock<ConnTable>, id: ConnectionId) -> Option<Arc<Mutex<Connection>>> {
    connections
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned()
}

/// The connection manager device handle.
pub struct CmDevice {
    config: CmConfig,
    connections: Arc<RwLock<ConnTable>>,
    services: ServiceRegistry,
    next_id: AtomicU32,
    event_pool: Arc<EventPool>,
    event_tx: mpsc::UnboundedSender<CmEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CmEvent>>,
}

impl CmDevice {
    /// Open the device. The configuration fixes the identifier and event
    /// pool limits for the device's lifetime.
    pub fn new(config: CmConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let event_pool = Arc::new(EventPool::new(config.cm.event_pool_size));

        info!(
            max_connection_ids = config.cm.max_connection_ids,
            event_pool_size = config.cm.event_pool_size,
            "opened connection manager device"
        );

        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            services: ServiceRegistry::default(),
            next_id: AtomicU32::new(1),
            event_pool,
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        }
    }

    fn conn(&self, id: ConnectionId) -> CmResult<Arc<Mutex<Connection>>> {
        lookup(&self.connections, id).ok_or(CmError::NotFound(id))
    }

    fn is_live(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Allocate a new identifier in `Idle`.
    pub fn create_id(&self) -> CmResult<ConnectionId> {
        let mut table = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.len() >= self.config.cm.max_connection_ids {
            warn!(
                limit = self.config.cm.max_connection_ids,
                "connection identifier table full"
            );
            return Err(CmError::ResourceExhausted("connection identifier table full"));
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        table.insert(id, Arc::new(Mutex::new(Connection::new(id))));
        debug!(%id, "created connection identifier");
        Ok(id)
    }

    /// Register interest in incoming requests matching `service_id`.
    /// `backlog == 0` selects the configured default.
    pub fn listen(&self, id: ConnectionId, service_id: ServiceId, backlog: usize) -> CmResult<()> {
        let conn = self.conn(id)?;
        let mut conn = lock_conn(&conn);

        let next = conn.state.apply(Operation::Listen)?;
        self.services.register(service_id, id)?;

        conn.transition(next);
        conn.role = Some(Role::Listener);
        conn.service_id = Some(service_id);
        conn.backlog = if backlog == 0 {
            self.config.cm.default_backlog
        } else {
            backlog
        };

        info!(%id, %service_id, backlog = conn.backlog, "listening");
        Ok(())
    }

    /// Send a connection request over `path` to whichever listener
    /// registered `service_id`. An unknown service is dropped at the
    /// transport boundary and the request eventually times out.
    pub fn connect(
        &self,
        id: ConnectionId,
        path: &PathRecord,
        service_id: ServiceId,
        params: RequestParams,
    ) -> CmResult<()> {
        path.validate()?;
        params.validate()?;

        // Zero timeout fields fall back to the configured defaults.
        let mut effective = params.clone();
        if effective.response_timeouts.remote.is_zero() {
            effective.response_timeouts.remote = self.config.timers.default_response_timeout;
        }
        if effective.max_cm_retries == 0 {
            effective.max_cm_retries = self.config.timers.default_max_retries;
        }
        let deadline = effective.reply_deadline();

        let conn = self.conn(id)?;
        let epoch = {
            let mut conn = lock_conn(&conn);
            let next = conn.state.apply(Operation::Connect)?;
            conn.transition(next);
            conn.role = Some(Role::Initiator);
            conn.service_id = Some(service_id);
            conn.epoch
        };

        debug!(
            %id, %service_id,
            qp_number = params.qp_number,
            starting_psn = params.starting_psn,
            dlid = %path.dlid,
            "sent connection request"
        );

        self.route_request(id, service_id, &params);
        self.arm_reply_timer(id, epoch, deadline);
        Ok(())
    }

    /// Send a reply for a received request; valid once the `ReqReceived`
    /// event for `id` has been delivered.
    pub fn accept(&self, id: ConnectionId, params: ReplyParams) -> CmResult<()> {
        params.validate()?;

        let conn = self.conn(id)?;
        let (peer, listener) = {
            let mut conn = lock_conn(&conn);
            let next = conn.state.apply(Operation::Accept)?;
            let Some(peer) = conn.peer else {
                return Err(CmError::InvalidState {
                    op: Operation::Accept,
                    state: conn.state,
                });
            };
            conn.transition(next);
            (peer, conn.listener.take())
        };

        if let Some(listener_id) = listener {
            self.drop_pending(listener_id);
        }

        debug!(%id, %peer, qp_number = params.qp_number, "sent connection reply");
        self.deliver(
            peer,
            Message::Rep,
            CmEventKind::RepReceived {
                remote_qpn: params.qp_number,
                starting_psn: params.starting_psn,
                private_data: params.private_payload.clone(),
            },
            Some((params.qp_number, params.starting_psn)),
            Some(id),
        );
        Ok(())
    }

    /// Actively refuse a received request; the peer's identifier returns
    /// to `Idle` with a `RejectReceived` event.
    pub fn reject(&self, id: ConnectionId, private_payload: Bytes) -> CmResult<()> {
        if private_payload.len() > MAX_REJ_PRIVATE_DATA {
            return Err(CmError::InvalidAddress(format!(
                "reject private payload of {} bytes exceeds the {} byte maximum",
                private_payload.len(),
                MAX_REJ_PRIVATE_DATA
            )));
        }

        let conn = self.conn(id)?;
        let (peer, listener) = {
            let mut conn = lock_conn(&conn);
            conn.state.apply(Operation::Reject)?;
            let Some(peer) = conn.peer else {
                return Err(CmError::InvalidState {
                    op: Operation::Reject,
                    state: conn.state,
                });
            };
            let listener = conn.listener.take();
            conn.reset();
            (peer, listener)
        };

        if let Some(listener_id) = listener {
            self.drop_pending(listener_id);
        }

        info!(%id, %peer, "rejected connection request");
        self.deliver(
            peer,
            Message::Rej,
            CmEventKind::RejectReceived {
                private_data: private_payload,
            },
            None,
            None,
        );
        Ok(())
    }

    /// Send the ready-to-use notification; valid once the `RepReceived`
    /// event for `id` has been delivered. The local identifier moves to
    /// `Established` immediately; the peer learns of it via an
    /// `Established` event.
    pub fn acknowledge(&self, id: ConnectionId) -> CmResult<()> {
        let conn = self.conn(id)?;
        let peer = {
            let mut conn = lock_conn(&conn);
            let next = conn.state.apply(Operation::Acknowledge)?;
            let Some(peer) = conn.peer else {
                return Err(CmError::InvalidState {
                    op: Operation::Acknowledge,
                    state: conn.state,
                });
            };
            conn.transition(next);
            peer
        };

        info!(%id, %peer, "connection established");
        self.deliver(peer, Message::Rtu, CmEventKind::Established, None, None);
        Ok(())
    }

    /// Ask the peer to tear the connection down.
    pub fn disconnect(&self, id: ConnectionId, private_payload: Bytes) -> CmResult<()> {
        if private_payload.len() > MAX_DREQ_PRIVATE_DATA {
            return Err(CmError::InvalidAddress(format!(
                "disconnect private payload of {} bytes exceeds the {} byte maximum",
                private_payload.len(),
                MAX_DREQ_PRIVATE_DATA
            )));
        }

        let conn = self.conn(id)?;
        let peer = {
            let mut conn = lock_conn(&conn);
            let next = conn.state.apply(Operation::Disconnect)?;
            let Some(peer) = conn.peer else {
                return Err(CmError::InvalidState {
                    op: Operation::Disconnect,
                    state: conn.state,
                });
            };
            conn.transition(next);
            peer
        };

        debug!(%id, %peer, "sent disconnect request");
        self.deliver(
            peer,
            Message::Dreq,
            CmEventKind::DreqReceived {
                private_data: private_payload,
            },
            None,
            None,
        );
        Ok(())
    }

    /// Answer a received disconnect request. Both sides enter `TimeWait`
    /// and are recycled to `Idle` once the TimeWait period elapses.
    pub fn disconnect_ack(&self, id: ConnectionId) -> CmResult<()> {
        let conn = self.conn(id)?;
        let (peer, epoch) = {
            let mut conn = lock_conn(&conn);
            let next = conn.state.apply(Operation::DisconnectAck)?;
            let Some(peer) = conn.peer else {
                return Err(CmError::InvalidState {
                    op: Operation::DisconnectAck,
                    state: conn.state,
                });
            };
            // Claim the TimeWait event slot before committing so pool
            // exhaustion fails the operation with state unchanged.
            let Some(slot) = self.event_pool.try_acquire() else {
                return Err(CmError::ResourceExhausted("event pool exhausted"));
            };
            conn.transition(next);
            let _ = self
                .event_tx
                .send(CmEvent::new(id, CmEventKind::TimeWait, State::TimeWait, slot));
            (peer, conn.epoch)
        };

        debug!(%id, %peer, "sent disconnect reply, entering timewait");
        self.arm_timewait_timer(id, epoch);

        if let Some(peer_epoch) = self.deliver(peer, Message::Drep, CmEventKind::DrepReceived, None, None)
        {
            self.arm_timewait_timer(peer, peer_epoch);
        }
        Ok(())
    }

    /// Release the identifier. Permitted from any state; a non-terminal
    /// state means an in-flight exchange is abandoned, not closed.
    /// Unconsumed events for the identifier are suppressed at poll time
    /// and their pool slots reclaimed.
    pub fn destroy(&self, id: ConnectionId) -> CmResult<()> {
        let removed = {
            let mut table = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            table.remove(&id)
        }
        .ok_or(CmError::NotFound(id))?;

        let conn = lock_conn(&removed);
        if !conn.state.is_quiescent() {
            warn!(
                %id, state = %conn.state,
                "destroying identifier in a non-terminal state, in-flight exchange abandoned"
            );
        }
        if conn.role == Some(Role::Listener) {
            if let Some(service_id) = conn.service_id {
                self.services.deregister(service_id);
            }
        }
        if conn.state == State::ReqRcvd {
            if let Some(listener_id) = conn.listener {
                self.drop_pending(listener_id);
            }
        }

        info!(%id, state = %conn.state, "destroyed connection identifier");
        Ok(())
    }

    /// Wait for the next event across all live identifiers. Single
    /// consumer; events for one identifier arrive in causal order.
    pub async fn poll_event(&self) -> CmResult<CmEvent> {
        let mut rx = self.event_rx.lock().await;
        loop {
            let event = rx.recv().await.ok_or(CmError::EventStreamClosed)?;
            if self.is_live(event.id) {
                return Ok(event);
            }
            debug!(id = %event.id, "suppressing event for destroyed identifier");
            event.release();
        }
    }

    /// Non-blocking variant of [`poll_event`](Self::poll_event). Returns
    /// `Ok(None)` when no event is ready or another task is polling.
    pub fn try_poll_event(&self) -> CmResult<Option<CmEvent>> {
        let mut rx = match self.event_rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => return Ok(None),
        };
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if self.is_live(event.id) {
                        return Ok(Some(event));
                    }
                    debug!(id = %event.id, "suppressing event for destroyed identifier");
                    event.release();
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(CmError::EventStreamClosed)
                }
            }
        }
    }

    /// Return an event's resources to the pool. Must be called exactly
    /// once per event retrieved.
    pub fn release_event(&self, event: CmEvent) {
        event.release();
    }

    /// Current state of an identifier.
    pub fn state(&self, id: ConnectionId) -> CmResult<State> {
        Ok(lock_conn(&self.conn(id)?).state)
    }

    /// Snapshot of an identifier.
    pub fn query(&self, id: ConnectionId) -> CmResult<ConnectionInfo> {
        Ok(lock_conn(&self.conn(id)?).info())
    }

    /// Number of live identifiers.
    pub fn live_identifiers(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivered-but-unreleased events.
    pub fn outstanding_events(&self) -> usize {
        self.event_pool.outstanding()
    }

    pub fn event_pool_capacity(&self) -> usize {
        self.event_pool.capacity()
    }
}

// Transport boundary: routing, delivery, timers.
impl CmDevice {
    /// Route a request to the listener registered for `service_id`,
    /// minting a passive-side identifier. Drops silently (debug log) when
    /// no listener matches; drops with a warning on backlog or resource
    /// pressure. The initiator learns of a drop only through its timeout.
    fn route_request(&self, initiator: ConnectionId, service_id: ServiceId, params: &RequestParams) {
        let Some(listener_id) = self.services.lookup(service_id) else {
            debug!(%service_id, "no listener for service, request dropped");
            return;
        };
        let Some(listener) = lookup(&self.connections, listener_id) else {
            debug!(%service_id, %listener_id, "listener identifier gone, request dropped");
            return;
        };

        {
            let mut listener = lock_conn(&listener);
            if listener.state != State::Listening {
                debug!(%listener_id, state = %listener.state, "listener not listening, request dropped");
                return;
            }
            if listener.pending >= listener.backlog {
                warn!(
                    %listener_id,
                    backlog = listener.backlog,
                    "listener backlog full, request dropped"
                );
                return;
            }
            listener.pending += 1;
        }

        let Some(slot) = self.event_pool.try_acquire() else {
            warn!(%listener_id, "event pool exhausted, incoming request dropped");
            self.drop_pending(listener_id);
            return;
        };

        let Some(passive_id) = self.mint_passive(initiator, listener_id, service_id, params) else {
            warn!(%listener_id, "identifier table full, incoming request dropped");
            self.drop_pending(listener_id);
            return;
        };

        info!(%passive_id, %listener_id, %service_id, "incoming connection request");
        let _ = self.event_tx.send(CmEvent::new(
            passive_id,
            CmEventKind::ReqReceived {
                listener: listener_id,
                service_id,
                remote_qpn: params.qp_number,
                starting_psn: params.starting_psn,
                private_data: params.private_payload.clone(),
            },
            State::ReqRcvd,
            slot,
        ));
    }

    /// Mint the transient passive-side identifier for one incoming
    /// request. Returns `None` when the identifier table is full.
    fn mint_passive(
        &self,
        initiator: ConnectionId,
        listener_id: ConnectionId,
        service_id: ServiceId,
        params: &RequestParams,
    ) -> Option<ConnectionId> {
        let mut table = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.len() >= self.config.cm.max_connection_ids {
            return None;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut conn = Connection::new(id);
        conn.transition(State::ReqRcvd);
        conn.role = Some(Role::Passive);
        conn.service_id = Some(service_id);
        conn.peer = Some(initiator);
        conn.listener = Some(listener_id);
        conn.remote_qpn = Some(params.qp_number);
        conn.starting_psn = Some(params.starting_psn);
        table.insert(id, Arc::new(Mutex::new(conn)));
        Some(id)
    }

    /// Apply a peer message to `target` and emit the matching event. A
    /// message the target's state does not expect surfaces as a non-fatal
    /// `Unhandled` event. Returns the target's epoch after an accepted
    /// transition.
    fn deliver(
        &self,
        target: ConnectionId,
        msg: Message,
        kind: CmEventKind,
        negotiated: Option<(u32, u32)>,
        peer: Option<ConnectionId>,
    ) -> Option<u64> {
        let Some(conn) = lookup(&self.connections, target) else {
            debug!(%target, ?msg, "peer identifier gone, message dropped");
            return None;
        };

        let outcome = {
            let mut conn = lock_conn(&conn);
            match conn.state.on_message(msg) {
                Some(next) => {
                    if next == State::Idle {
                        conn.reset();
                    } else {
                        conn.transition(next);
                    }
                    if let Some((qpn, psn)) = negotiated {
                        conn.remote_qpn = Some(qpn);
                        conn.starting_psn = Some(psn);
                    }
                    if let Some(peer) = peer {
                        conn.peer = Some(peer);
                    }
                    Ok((conn.state, conn.epoch))
                }
                None => Err(conn.state),
            }
        };

        match outcome {
            Ok((state, epoch)) => {
                self.emit(target, kind, state);
                Some(epoch)
            }
            Err(state) => {
                warn!(%target, ?msg, %state, "message not handled in current state");
                self.emit(
                    target,
                    CmEventKind::Unhandled {
                        description: format!("{msg:?} received in state {state}"),
                    },
                    state,
                );
                None
            }
        }
    }

    /// Emit a transport-originated event, dropping it with a warning when
    /// the pool is exhausted.
    fn emit(&self, id: ConnectionId, kind: CmEventKind, state: State) {
        match self.event_pool.try_acquire() {
            Some(slot) => {
                let _ = self.event_tx.send(CmEvent::new(id, kind, state, slot));
            }
            None => warn!(%id, "event pool exhausted, event dropped"),
        }
    }

    fn drop_pending(&self, listener_id: ConnectionId) {
        if let Some(listener) = lookup(&self.connections, listener_id) {
            let mut listener = lock_conn(&listener);
            listener.pending = listener.pending.saturating_sub(1);
        }
    }

    /// Fail the request with `ReqTimeout` once the retry budget elapses,
    /// unless the identifier moved on (reply arrived, destroyed, reused).
    fn arm_reply_timer(&self, id: ConnectionId, epoch: u64, deadline: Duration) {
        let connections = Arc::clone(&self.connections);
        let event_pool = Arc::clone(&self.event_pool);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;

            let Some(conn) = lookup(&connections, id) else {
                return;
            };
            {
                let mut conn = lock_conn(&conn);
                if conn.epoch != epoch || conn.state != State::ReqSent {
                    return;
                }
                conn.reset();
            }

            warn!(%id, "connection request timed out, retry budget exhausted");
            match event_pool.try_acquire() {
                Some(slot) => {
                    let _ = event_tx.send(CmEvent::new(id, CmEventKind::ReqTimeout, State::Idle, slot));
                }
                None => warn!(%id, "event pool exhausted, timeout event dropped"),
            }
        });
    }

    /// Recycle the identifier to `Idle` once the TimeWait period elapses.
    fn arm_timewait_timer(&self, id: ConnectionId, epoch: u64) {
        let connections = Arc::clone(&self.connections);
        let event_pool = Arc::clone(&self.event_pool);
        let event_tx = self.event_tx.clone();
        let period = self.config.timers.timewait_period;

        tokio::spawn(async move {
            tokio::time::sleep(period).await;

            let Some(conn) = lookup(&connections, id) else {
                return;
            };
            {
                let mut conn = lock_conn(&conn);
                if conn.epoch != epoch || conn.state != State::TimeWait {
                    return;
                }
                conn.reset();
            }

            debug!(%id, "timewait elapsed, identifier recycled to idle");
            match event_pool.try_acquire() {
                Some(slot) => {
                    let _ = event_tx.send(CmEvent::new(id, CmEventKind::Idle, State::Idle, slot));
                }
                None => warn!(%id, "event pool exhausted, idle event dropped"),
            }
        });
    }
}

impl Drop for CmDevice {
    fn drop(&mut self) {
        info!(
            live_identifiers = self.live_identifiers(),
            outstanding_events = self.outstanding_events(),
            "closing connection manager device"
        );
    }
}
