//! Typed Path Records
//!
//! Strongly-typed addressing and QoS description for routing a connection
//! request. A path record is owned by the caller and immutable once
//! submitted; byte-level endian handling belongs to a real transport, not
//! this structure.

use std::fmt;

use crate::error::{CmError, CmResult};
use crate::protocol::constants::*;

/// 128-bit global identifier, split into the subnet prefix and the
/// interface id the way the subnet administrator encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gid {
    pub subnet_prefix: u64,
    pub interface_id: u64,
}

impl Gid {
    pub const fn new(subnet_prefix: u64, interface_id: u64) -> Self {
        Self {
            subnet_prefix,
            interface_id,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.subnet_prefix == 0 && self.interface_id == 0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.subnet_prefix, self.interface_id)
    }
}

/// 16-bit local identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lid(pub u16);

impl Lid {
    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Path MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    pub fn bytes(self) -> usize {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu::Mtu1024
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Addressing and QoS description used to route a connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub sgid: Gid,
    pub dgid: Gid,
    pub slid: Lid,
    pub dlid: Lid,
    pub pkey: u16,
    pub mtu: Mtu,
    pub mtu_selector: u8,
    pub rate: u8,
    pub rate_selector: u8,
    pub packet_life_time: u8,
    pub packet_life_time_selector: u8,
    pub reversible: bool,
}

impl PathRecord {
    /// Build a path record between two endpoints with the default QoS
    /// attributes.
    pub fn new(sgid: Gid, dgid: Gid, slid: Lid, dlid: Lid) -> Self {
        Self {
            sgid,
            dgid,
            slid,
            dlid,
            pkey: DEFAULT_PKEY,
            mtu: Mtu::default(),
            mtu_selector: DEFAULT_SELECTOR,
            rate: DEFAULT_RATE,
            rate_selector: DEFAULT_SELECTOR,
            packet_life_time: DEFAULT_PACKET_LIFE_TIME,
            packet_life_time_selector: DEFAULT_SELECTOR,
            reversible: true,
        }
    }

    /// Reject records that cannot possibly route a request.
    pub fn validate(&self) -> CmResult<()> {
        if self.sgid.is_unspecified() || self.dgid.is_unspecified() {
            return Err(CmError::InvalidAddress(
                "path record carries an unspecified gid".to_string(),
            ));
        }
        if self.slid.is_unspecified() || self.dlid.is_unspecified() {
            return Err(CmError::InvalidAddress(
                "path record carries an unspecified lid".to_string(),
            ));
        }
        if self.pkey == 0 {
            return Err(CmError::InvalidAddress(
                "path record carries a zero pkey".to_string(),
            ));
        }
        Ok(())
    }
}
