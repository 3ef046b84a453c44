use std::collections::HashSet;
use std::sync::Arc;

use gpibtool_protocol::{HandleId, ResourceAddress};
use parking_lot::Mutex;

use crate::backend::{Backend, SessionHandle};

struct InventoryShared {
    claimed: HashSet<HandleId>,
}

/// Book-keeping of the addresses that currently have a session.
///
/// At most one session per [`HandleId`] exists at any time: an address must be
/// claimed before the backend is asked to open it.
#[derive(Clone)]
pub struct Inventory(Arc<Mutex<InventoryShared>>);

impl Inventory {
    pub fn new() -> Self {
        let inner = InventoryShared {
            claimed: Default::default(),
        };
        Self(Arc::new(Mutex::new(inner)))
    }

    /// Reserve `id`. Returns `None` if it is already held.
    pub fn claim(&self, id: HandleId) -> Option<Claim> {
        let mut inner = self.0.lock();
        if !inner.claimed.insert(id.clone()) {
            return None;
        }
        Some(Claim {
            inventory: self.clone(),
            id,
        })
    }

    fn release(&self, id: &HandleId) {
        self.0.lock().claimed.remove(id);
    }

    pub fn len(&self) -> usize {
        self.0.lock().claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved address. Dropping it makes the address available again.
pub struct Claim {
    inventory: Inventory,
    id: HandleId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.inventory.release(&self.id);
    }
}

/// An open connection to one instrument.
///
/// The backend session is closed and the address released when the `Session`
/// goes out of scope, including on error paths and cancelled futures.
pub struct Session {
    address: ResourceAddress,
    handle: SessionHandle,
    backend: Arc<dyn Backend>,
    closed: bool,
    _claim: Claim,
}

impl Session {
    pub(crate) fn new(
        address: ResourceAddress,
        handle: SessionHandle,
        backend: Arc<dyn Backend>,
        claim: Claim,
    ) -> Self {
        Self {
            address,
            handle,
            backend,
            closed: false,
            _claim: claim,
        }
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::debug!("Closing session {} to {}", self.handle, self.address);
        self.backend.close(self.handle);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
