//! Connection Management Protocol
//!
//! States, operations, negotiated parameters, and path records for the
//! RDMA-style connection establishment/teardown handshake.

pub mod constants;
pub mod path;
pub mod state;
pub mod types;

pub use path::{Gid, Lid, Mtu, PathRecord};
pub use state::{Operation, State};
pub use types::{
    ConnectionId, ReplyParams, RequestParams, ResponseTimeouts, Role, ServiceId,
};
