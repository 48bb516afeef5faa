//! RustCM Library
//!
//! Connection manager for reliable point-to-point connections: a
//! service-addressed request/reply handshake, explicit teardown with a
//! TimeWait quarantine, and an event stream reporting every state change.
//!
//! Open a [`CmDevice`], create identifiers, and drive them with `listen`,
//! `connect`, `accept`, `acknowledge`, `disconnect`, and `disconnect_ack`
//! while a consumer loops on [`CmDevice::poll_event`].

pub mod cm;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;

pub use cm::{CmDevice, ConnectionInfo};
pub use config::CmConfig;
pub use error::{CmError, CmResult};
pub use event::{CmEvent, CmEventKind};
