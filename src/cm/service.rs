//! Service Identifier Registry
//!
//! The in-memory transport boundary: connection requests are routed to
//! whichever identifier registered interest in the service id. A request
//! for an unregistered service is silently dropped by the caller.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{CmError, CmResult};
use crate::protocol::types::{ConnectionId, ServiceId};

#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    inner: RwLock<HashMap<ServiceId, ConnectionId>>,
}

impl ServiceRegistry {
    pub(crate) fn register(&self, service_id: ServiceId, id: ConnectionId) -> CmResult<()> {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(&service_id) {
            return Err(CmError::InvalidAddress(format!(
                "service id {service_id} already has a listener"
            )));
        }
        table.insert(service_id, id);
        Ok(())
    }

    pub(crate) fn deregister(&self, service_id: ServiceId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&service_id);
    }

    pub(crate) fn lookup(&self, service_id: ServiceId) -> Option<ConnectionId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&service_id)
            .copied()
    }
}
