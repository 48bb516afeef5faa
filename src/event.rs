//! Event Delivery
//!
//! Delivered notifications and the bounded pool backing them. Every event
//! handed out by the device occupies one pool slot; the consumer must return
//! the slot with `CmDevice::release_event` exactly once. A dropped,
//! unreleased event leaks its slot, which shows up as pool exhaustion once
//! the outstanding count reaches the configured capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::protocol::state::State;
use crate::protocol::types::{ConnectionId, ServiceId};

/// A delivered notification. Consumed exactly once by the owning
/// application loop; ownership transfers to the consumer.
#[derive(Debug)]
pub struct CmEvent {
    pub id: ConnectionId,
    pub kind: CmEventKind,
    /// The identifier's state after the transition this event reports.
    pub state: State,
    slot: EventSlot,
}

impl CmEvent {
    pub(crate) fn new(id: ConnectionId, kind: CmEventKind, state: State, slot: EventSlot) -> Self {
        Self {
            id,
            kind,
            state,
            slot,
        }
    }

    /// Return the pool slot. Called through `CmDevice::release_event`.
    pub(crate) fn release(self) {
        self.slot.release();
    }
}

/// What the event reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEventKind {
    /// An incoming request minted this new passive-side identifier. The
    /// listener stays in `Listening`.
    ReqReceived {
        listener: ConnectionId,
        service_id: ServiceId,
        remote_qpn: u32,
        starting_psn: u32,
        private_data: Bytes,
    },
    /// The peer answered our request.
    RepReceived {
        remote_qpn: u32,
        starting_psn: u32,
        private_data: Bytes,
    },
    /// The peer's ready-to-use notification arrived; the connection is up.
    Established,
    /// The peer asked to tear the connection down.
    DreqReceived { private_data: Bytes },
    /// The peer acknowledged our disconnect request.
    DrepReceived,
    /// The identifier entered the TimeWait holddown.
    TimeWait,
    /// The TimeWait interval elapsed; the identifier is recycled.
    Idle,
    /// The peer refused our request; the identifier is back in `Idle`.
    RejectReceived { private_data: Bytes },
    /// No reply arrived within the configured retry budget; the identifier
    /// is back in `Idle`.
    ReqTimeout,
    /// A message arrived in a state the state machine does not handle.
    /// Non-fatal; the poll loop continues.
    Unhandled { description: String },
}

impl CmEventKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReqReceived { .. } => "req_received",
            Self::RepReceived { .. } => "rep_received",
            Self::Established => "established",
            Self::DreqReceived { .. } => "dreq_received",
            Self::DrepReceived => "drep_received",
            Self::TimeWait => "timewait",
            Self::Idle => "idle",
            Self::RejectReceived { .. } => "reject_received",
            Self::ReqTimeout => "req_timeout",
            Self::Unhandled { .. } => "unhandled",
        }
    }
}

/// Bounded accounting for outstanding (delivered but unreleased) events.
///
/// Modeled as a slot counter rather than a buffer: the event payloads ride
/// the delivery channel, the pool only enforces the bound and makes leaks
/// observable.
#[derive(Debug)]
pub(crate) struct EventPool {
    capacity: usize,
    outstanding: AtomicUsize,
}

impl EventPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Claim one slot. Fails when the pool is exhausted.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<EventSlot> {
        let claimed = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if claimed {
            Some(EventSlot {
                pool: Arc::clone(self),
            })
        } else {
            None
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn put_back(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "event pool released more slots than acquired");
    }
}

/// One claimed pool slot. Deliberately has no `Drop` release: an event the
/// consumer forgets to release keeps its slot claimed, so leaks are
/// detectable as pool exhaustion.
#[derive(Debug)]
pub(crate) struct EventSlot {
    pool: Arc<EventPool>,
}

impl EventSlot {
    pub(crate) fn release(self) {
        self.pool.put_back();
        debug!(
            outstanding = self.pool.outstanding(),
            "released event pool slot"
        );
    }
}
