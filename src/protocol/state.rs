//! Connection State Machine
//!
//! The transition table for a single connection identifier. Locally driven
//! operations go through [`State::apply`]; transitions caused by a delivered
//! peer message go through [`State::on_message`]. Both leave the state
//! untouched on an invalid pairing.

use std::fmt;

use crate::error::CmError;

/// States a connection identifier moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Listening,
    ReqSent,
    ReqRcvd,
    RepSent,
    RepRcvd,
    Established,
    DreqSent,
    DreqRcvd,
    TimeWait,
}

impl State {
    /// Successor state for a locally invoked operation, or `InvalidState`.
    pub fn apply(self, op: Operation) -> Result<State, CmError> {
        use Operation::*;
        use State::*;

        let next = match (self, op) {
            (Idle, Listen) => Listening,
            (Idle, Connect) => ReqSent,
            (ReqRcvd, Accept) => RepSent,
            (ReqRcvd, Reject) => Idle,
            (RepRcvd, Acknowledge) => Established,
            (Established, Disconnect) => DreqSent,
            (DreqRcvd, DisconnectAck) => TimeWait,
            (state, op) => return Err(CmError::InvalidState { op, state }),
        };
        Ok(next)
    }

    /// Successor state when a peer message arrives, or `None` when the
    /// message is not expected in this state (surfaced as an `Unhandled`
    /// event, never a crash).
    pub(crate) fn on_message(self, msg: Message) -> Option<State> {
        use Message::*;
        use State::*;

        match (self, msg) {
            (ReqSent, Rep) => Some(RepRcvd),
            (ReqSent, Rej) => Some(Idle),
            (RepSent, Rtu) => Some(Established),
            (Established, Dreq) => Some(DreqRcvd),
            (DreqSent, Drep) => Some(TimeWait),
            _ => None,
        }
    }

    /// A quiescent identifier can be destroyed without abandoning an
    /// in-flight exchange.
    pub fn is_quiescent(self) -> bool {
        matches!(self, State::Idle | State::Listening | State::TimeWait)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "Idle",
            State::Listening => "Listening",
            State::ReqSent => "ReqSent",
            State::ReqRcvd => "ReqRcvd",
            State::RepSent => "RepSent",
            State::RepRcvd => "RepRcvd",
            State::Established => "Established",
            State::DreqSent => "DreqSent",
            State::DreqRcvd => "DreqRcvd",
            State::TimeWait => "TimeWait",
        };
        f.write_str(name)
    }
}

/// Locally invoked state-mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Listen,
    Connect,
    Accept,
    Reject,
    Acknowledge,
    Disconnect,
    DisconnectAck,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Listen => "listen",
            Operation::Connect => "connect",
            Operation::Accept => "accept",
            Operation::Reject => "reject",
            Operation::Acknowledge => "acknowledge",
            Operation::Disconnect => "disconnect",
            Operation::DisconnectAck => "disconnect_ack",
        };
        f.write_str(name)
    }
}

/// Peer-originated protocol messages routed by the in-memory transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Message {
    Rep,
    Rej,
    Rtu,
    Dreq,
    Drep,
}
