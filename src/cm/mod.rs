//! Connection management: identifier records, service registry, and the
//! device handle tying them together.

pub mod connection;
pub mod device;
pub mod service;

pub use connection::ConnectionInfo;
pub use device::CmDevice;
