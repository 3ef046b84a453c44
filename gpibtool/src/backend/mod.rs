//! The narrow interface between the core and a concrete driver stack.
//!
//! The core only ever talks to instruments through [`Backend`]. Concrete
//! implementations:
//!
//!  * [`loopback::LoopbackBus`] - a simulated bus of scripted instruments, always built
//!  * `prologix::PrologixBackend` - a Prologix GPIB-USB controller (feature `prologix`)
//!  * `visa::VisaBackend` - the system VISA library (feature `visa`)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use gpibtool_protocol::{IoFailure, OpenFailure, ResourceAddress};

use crate::config::{BackendKind, Config};

pub mod loopback;
#[cfg(feature = "prologix")]
pub mod prologix;
#[cfg(feature = "visa")]
pub mod visa;

/// Opaque identifier of a session handed out by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bytes returned by a single backend read.
///
/// `end` is set when the backend saw the end of the message (GPIB EOI, VISA
/// END). A chunk without `end` may be followed by more data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    pub end: bool,
}

impl ReadChunk {
    pub fn more(data: Vec<u8>) -> Self {
        Self { data, end: false }
    }

    pub fn last(data: Vec<u8>) -> Self {
        Self { data, end: true }
    }
}

/// Session primitives of an instrument driver stack.
///
/// `close` is synchronous so a session can be released from `Drop`, which
/// also covers cancelled futures. It must tolerate unknown or already closed
/// handles.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether sessions to *different* addresses may be used concurrently.
    fn supports_concurrent_sessions(&self) -> bool {
        false
    }

    /// List the resource strings currently visible on the bus.
    async fn enumerate(&self) -> Result<Vec<String>, IoFailure>;

    async fn open(
        &self,
        addr: &ResourceAddress,
        timeout: Duration,
    ) -> Result<SessionHandle, OpenFailure>;

    async fn write(&self, session: SessionHandle, data: &[u8]) -> Result<(), IoFailure>;

    /// Read whatever the instrument has sent, waiting at most `timeout`.
    async fn read(&self, session: SessionHandle, timeout: Duration) -> Result<ReadChunk, IoFailure>;

    fn close(&self, session: SessionHandle);
}

/// Instantiate the backend selected by the configuration.
pub fn connect(config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    log::debug!("Using {} backend", config.backend);
    match config.backend {
        BackendKind::Loopback => {
            if config.loopback.instruments.is_empty() {
                log::warn!(
                    "The loopback bus has no instruments configured, \
                     select a hardware backend with --backend or the config file"
                );
            }
            Ok(Arc::new(loopback::LoopbackBus::from_config(
                &config.loopback,
            )))
        }
        BackendKind::Prologix => prologix_backend(config),
        BackendKind::Visa => visa_backend(config),
    }
}

#[cfg(feature = "prologix")]
fn prologix_backend(config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    Ok(Arc::new(prologix::PrologixBackend::new(
        config.prologix.clone(),
    )))
}

#[cfg(not(feature = "prologix"))]
fn prologix_backend(_config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    Err(anyhow!(
        "gpibtool was built without the `prologix` feature"
    ))
}

#[cfg(feature = "visa")]
fn visa_backend(config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    let backend = visa::VisaBackend::new(config.timeout)
        .map_err(|err| anyhow!("cannot load VISA: {}", err))?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "visa"))]
fn visa_backend(_config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    Err(anyhow!("gpibtool was built without the `visa` feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_loopback() {
        let config = Config {
            backend: BackendKind::Loopback,
            ..Default::default()
        };
        let backend = connect(&config).unwrap();
        assert_eq!(backend.name(), "loopback");
    }

    #[cfg(not(feature = "visa"))]
    #[test]
    fn connect_missing_feature() {
        let config = Config {
            backend: BackendKind::Visa,
            ..Default::default()
        };
        let err = connect(&config).err().unwrap();
        assert!(err.to_string().contains("`visa` feature"));
    }
}
