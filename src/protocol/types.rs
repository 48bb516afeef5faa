//! Connection Manager Protocol Types

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{CmError, CmResult};
use crate::protocol::constants::*;

/// Opaque handle identifying one connection attempt or established
/// connection. Numbers are never reallocated within a device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cm_id<{}>", self.0)
    }
}

/// Service identifier a listener registers interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Which side of the handshake an identifier plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Actively sent a connection request.
    Initiator,
    /// Registered interest in a service id.
    Listener,
    /// Minted by a listener for one incoming request.
    Passive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Initiator => "initiator",
            Role::Listener => "listener",
            Role::Passive => "passive",
        };
        f.write_str(name)
    }
}

/// How long each side may take to answer before the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeouts {
    pub local: Duration,
    pub remote: Duration,
}

impl Default for ResponseTimeouts {
    fn default() -> Self {
        Self {
            local: Duration::from_secs(2),
            remote: Duration::from_secs(2),
        }
    }
}

/// Configuration carried by a connection request (REQ).
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub qp_number: u32,
    pub starting_psn: u32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub flow_control: bool,
    pub response_timeouts: ResponseTimeouts,
    pub max_cm_retries: u8,
    pub private_payload: Bytes,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            qp_number: 0,
            starting_psn: 0,
            responder_resources: DEFAULT_RESPONDER_RESOURCES,
            initiator_depth: DEFAULT_INITIATOR_DEPTH,
            retry_count: DEFAULT_RETRY_COUNT,
            rnr_retry_count: DEFAULT_RNR_RETRY_COUNT,
            flow_control: true,
            response_timeouts: ResponseTimeouts::default(),
            max_cm_retries: DEFAULT_MAX_CM_RETRIES,
            private_payload: Bytes::new(),
        }
    }
}

impl RequestParams {
    pub fn validate(&self) -> CmResult<()> {
        if self.private_payload.len() > MAX_REQ_PRIVATE_DATA {
            return Err(CmError::InvalidAddress(format!(
                "request private payload of {} bytes exceeds the {} byte maximum",
                self.private_payload.len(),
                MAX_REQ_PRIVATE_DATA
            )));
        }
        Ok(())
    }

    /// Total time an initiator waits for a reply before the transport gives
    /// up retransmitting and the request is failed with `Timeout`.
    pub fn reply_deadline(&self) -> Duration {
        self.response_timeouts
            .remote
            .checked_mul(u32::from(self.max_cm_retries.max(1)))
            .unwrap_or(Duration::MAX)
    }
}

/// Configuration carried by a connection reply (REP).
#[derive(Debug, Clone)]
pub struct ReplyParams {
    pub qp_number: u32,
    pub starting_psn: u32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub rnr_retry_count: u8,
    pub flow_control: bool,
    pub target_ack_delay: u8,
    pub failover_accepted: bool,
    pub private_payload: Bytes,
}

impl Default for ReplyParams {
    fn default() -> Self {
        Self {
            qp_number: 0,
            starting_psn: 0,
            responder_resources: DEFAULT_RESPONDER_RESOURCES,
            initiator_depth: DEFAULT_INITIATOR_DEPTH,
            rnr_retry_count: DEFAULT_RNR_RETRY_COUNT,
            flow_control: true,
            target_ack_delay: DEFAULT_TARGET_ACK_DELAY,
            failover_accepted: false,
            private_payload: Bytes::new(),
        }
    }
}

impl ReplyParams {
    pub fn validate(&self) -> CmResult<()> {
        if self.private_payload.len() > MAX_REP_PRIVATE_DATA {
            return Err(CmError::InvalidAddress(format!(
                "reply private payload of {} bytes exceeds the {} byte maximum",
                self.private_payload.len(),
                MAX_REP_PRIVATE_DATA
            )));
        }
        Ok(())
    }
}
