use std::sync::Arc;
use std::time::Duration;

use gpibtool_protocol::{AddressTable, Error, OpenFailure, ResourceAddress, Result};

use crate::backend::Backend;
use crate::inventory::{Inventory, Session};

/// Turns address strings into validated addresses and open sessions.
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn Backend>,
    inventory: Inventory,
}

impl Resolver {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            inventory: Inventory::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Parse `raw` without touching the bus.
    pub fn validate(&self, raw: &str) -> Result<ResourceAddress> {
        ResourceAddress::parse(raw)
    }

    /// Ask the backend which resources are visible.
    pub async fn enumerate(&self) -> Result<AddressTable> {
        let found = self.backend.enumerate().await.map_err(Error::Enumerate)?;
        log::debug!("Backend `{}` lists {} resources", self.backend.name(), found.len());
        Ok(AddressTable::new(found))
    }

    /// Open an exclusive session to `addr`.
    ///
    /// Fails with [`OpenFailure::Busy`] without contacting the backend if a
    /// session to the same address is already open.
    pub async fn open(&self, addr: &ResourceAddress, timeout: Duration) -> Result<Session> {
        let claim = match self.inventory.claim(addr.handle_id()) {
            Some(claim) => claim,
            None => {
                log::debug!("Refusing second session to {}", addr);
                return Err(Error::open(addr.to_string(), OpenFailure::Busy));
            }
        };
        log::debug!("Opening {}", addr);
        let handle = self
            .backend
            .open(addr, timeout)
            .await
            .map_err(|kind| Error::open(addr.to_string(), kind))?;
        Ok(Session::new(
            addr.clone(),
            handle,
            self.backend.clone(),
            claim,
        ))
    }

    /// Release a session. Equivalent to dropping it.
    pub fn close(&self, session: Session) {
        session.close()
    }

    /// Number of sessions currently open through this resolver.
    pub fn open_sessions(&self) -> usize {
        self.inventory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::{Fault, LoopbackBus, LoopbackInstrument};
    use gpibtool_protocol::ErrorKind;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn setup() -> (Arc<LoopbackBus>, Resolver) {
        let bus = Arc::new(LoopbackBus::new(vec![
            LoopbackInstrument::new("GPIB0::6::INSTR").with_idn("KEITHLEY"),
            LoopbackInstrument::new("GPIB0::1::INSTR").with_fault(Fault::PermissionDenied),
        ]));
        let resolver = Resolver::new(bus.clone());
        (bus, resolver)
    }

    #[test]
    fn validate_does_not_touch_the_backend() {
        let (bus, resolver) = setup();
        let err = resolver.validate("not-an-address").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
        assert_eq!(err.address(), Some("not-an-address"));
        assert_eq!(bus.calls().total(), 0);
    }

    #[tokio::test]
    async fn open_and_close() {
        let (bus, resolver) = setup();
        let addr = resolver.validate("GPIB::6").unwrap();
        let session = resolver.open(&addr, TIMEOUT).await.unwrap();
        assert_eq!(session.address().to_string(), "GPIB0::6::INSTR");
        assert_eq!(resolver.open_sessions(), 1);
        assert_eq!(bus.open_sessions(), 1);

        resolver.close(session);
        assert_eq!(resolver.open_sessions(), 0);
        assert_eq!(bus.open_sessions(), 0);
        assert_eq!(bus.calls().close, 1);
    }

    #[tokio::test]
    async fn second_open_is_busy_without_backend_call() {
        let (bus, resolver) = setup();
        let addr = resolver.validate("GPIB0::6::INSTR").unwrap();
        let _session = resolver.open(&addr, TIMEOUT).await.unwrap();

        let err = resolver
            .open(&resolver.validate("GPIB::6").unwrap(), TIMEOUT)
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::open("GPIB0::6::INSTR", OpenFailure::Busy));
        assert_eq!(bus.calls().open, 1);
        assert_eq!(bus.double_opens(), 0);
    }

    #[tokio::test]
    async fn failed_open_releases_the_address() {
        let (bus, resolver) = setup();
        let addr = resolver.validate("GPIB0::1::INSTR").unwrap();
        for _ in 0..2 {
            let err = resolver.open(&addr, TIMEOUT).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        }
        assert_eq!(bus.calls().open, 2);
        assert_eq!(resolver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn dropped_session_is_closed() {
        let (bus, resolver) = setup();
        let addr = resolver.validate("GPIB0::6::INSTR").unwrap();
        {
            let _session = resolver.open(&addr, TIMEOUT).await.unwrap();
        }
        assert_eq!(bus.open_sessions(), 0);
        assert_eq!(resolver.open_sessions(), 0);
        assert!(resolver.open(&addr, TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn enumerate_lists_backend_resources() {
        let (_, resolver) = setup();
        let table = resolver.enumerate().await.unwrap();
        assert_eq!(table.as_slice(), &["GPIB0::6::INSTR", "GPIB0::1::INSTR"]);
    }
}
