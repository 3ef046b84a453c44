//! Backend for the Prologix GPIB-USB controller.
//!
//! The controller sits behind a serial port and talks to one listener at a
//! time, so sessions are logical: each one remembers the GPIB address and the
//! controller is re-addressed before every transfer.
//! http://prologix.biz/gpib-usb-controller.html

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gpibtool_protocol::{IoFailure, OpenFailure, ResourceAddress};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::backend::{Backend, ReadChunk, SessionHandle};
use crate::config::PrologixConfig;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(2);

#[derive(Clone, Copy)]
struct Listener {
    primary: u8,
    secondary: Option<u8>,
}

impl Listener {
    fn addr_command(&self) -> String {
        match self.secondary {
            // secondary addresses are sent as 96 + n
            Some(secondary) => format!("++addr {} {}\n", self.primary, 96 + secondary as u16),
            None => format!("++addr {}\n", self.primary),
        }
    }
}

pub struct PrologixBackend {
    config: PrologixConfig,
    serial: AsyncMutex<Option<SerialStream>>,
    sessions: Mutex<HashMap<SessionHandle, Listener>>,
    next_handle: AtomicU64,
}

impl PrologixBackend {
    pub fn new(config: PrologixConfig) -> Self {
        Self {
            config,
            serial: AsyncMutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn listener(&self, session: SessionHandle) -> Result<Listener, IoFailure> {
        self.sessions
            .lock()
            .get(&session)
            .copied()
            .ok_or_else(|| IoFailure::Backend(format!("invalid session {}", session)))
    }

    async fn connect(&self, serial: &mut Option<SerialStream>) -> Result<(), OpenFailure> {
        if serial.is_some() {
            return Ok(());
        }
        log::debug!("Opening Prologix controller on {}", self.config.port);
        let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()
            .map_err(map_serial_error)?;
        init_prologix(&mut stream)
            .await
            .map_err(|err| OpenFailure::BackendUnavailable(err.to_string()))?;
        *serial = Some(stream);
        Ok(())
    }
}

fn map_serial_error(err: tokio_serial::Error) -> OpenFailure {
    match err.kind() {
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            OpenFailure::PermissionDenied
        }
        _ => OpenFailure::BackendUnavailable(err.to_string()),
    }
}

fn map_io_error(err: io::Error) -> IoFailure {
    match err.kind() {
        io::ErrorKind::TimedOut => IoFailure::Timeout,
        _ => IoFailure::Backend(err.to_string()),
    }
}

async fn init_prologix(serial: &mut SerialStream) -> io::Result<()> {
    log::debug!("Initializing Prologix controller");
    serial.write_all(b"++savecfg 0\n").await?;
    serial.write_all(b"++auto 0\n").await?;
    // terminations are appended by the dispatcher
    serial.write_all(b"++eos 3\n").await
}

/// Discard whatever the controller still has buffered from a previous transfer.
async fn drain(serial: &mut SerialStream) -> io::Result<()> {
    let mut buf = [0u8; 256];
    loop {
        match time::timeout(DRAIN_TIMEOUT, serial.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(()),
            Ok(Ok(n)) => log::debug!("Discarding {} stale bytes", n),
            Ok(Err(err)) => return Err(err),
        }
    }
}

#[async_trait]
impl Backend for PrologixBackend {
    fn name(&self) -> &'static str {
        "prologix"
    }

    async fn enumerate(&self) -> Result<Vec<String>, IoFailure> {
        let ret = self
            .config
            .listeners
            .iter()
            .map(|addr| format!("GPIB{}::{}::INSTR", self.config.board, addr))
            .collect();
        Ok(ret)
    }

    async fn open(
        &self,
        addr: &ResourceAddress,
        _timeout: Duration,
    ) -> Result<SessionHandle, OpenFailure> {
        let (primary, secondary) = addr.gpib_address().ok_or(OpenFailure::NotPresent)?;
        if addr.board() != self.config.board {
            return Err(OpenFailure::NotPresent);
        }
        let mut serial = self.serial.lock().await;
        self.connect(&mut serial).await?;
        let handle = SessionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .lock()
            .insert(handle, Listener { primary, secondary });
        Ok(handle)
    }

    async fn write(&self, session: SessionHandle, data: &[u8]) -> Result<(), IoFailure> {
        let listener = self.listener(session)?;
        let mut serial = self.serial.lock().await;
        let serial = serial
            .as_mut()
            .ok_or_else(|| IoFailure::Backend("controller not connected".to_string()))?;
        drain(serial).await.map_err(map_io_error)?;
        serial
            .write_all(listener.addr_command().as_bytes())
            .await
            .map_err(map_io_error)?;
        serial.write_all(data).await.map_err(map_io_error)
    }

    async fn read(
        &self,
        session: SessionHandle,
        timeout: Duration,
    ) -> Result<ReadChunk, IoFailure> {
        let listener = self.listener(session)?;
        let mut serial = self.serial.lock().await;
        let serial = serial
            .as_mut()
            .ok_or_else(|| IoFailure::Backend("controller not connected".to_string()))?;
        serial
            .write_all(listener.addr_command().as_bytes())
            .await
            .map_err(map_io_error)?;
        serial.write_all(b"++read eoi\n").await.map_err(map_io_error)?;

        let mut ret = Vec::new();
        let reply = async {
            loop {
                let byte = serial.read_u8().await?;
                ret.push(byte);
                if byte == b'\n' {
                    return Ok::<_, io::Error>(());
                }
            }
        };
        let result = time::timeout(timeout, reply).await;
        match result {
            Ok(Ok(())) => Ok(ReadChunk::last(ret)),
            Ok(Err(err)) => Err(map_io_error(err)),
            Err(_) => {
                log::debug!("Prologix read timeout");
                Err(IoFailure::Timeout)
            }
        }
    }

    fn close(&self, session: SessionHandle) {
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing() {
        let primary = Listener {
            primary: 6,
            secondary: None,
        };
        assert_eq!(primary.addr_command(), "++addr 6\n");
        let secondary = Listener {
            primary: 6,
            secondary: Some(2),
        };
        assert_eq!(secondary.addr_command(), "++addr 6 98\n");
    }

    #[tokio::test]
    async fn enumerate_configured_listeners() {
        let backend = PrologixBackend::new(PrologixConfig {
            listeners: vec![1, 22],
            ..Default::default()
        });
        assert_eq!(
            backend.enumerate().await.unwrap(),
            vec!["GPIB0::1::INSTR".to_string(), "GPIB0::22::INSTR".to_string()]
        );
    }

    #[tokio::test]
    async fn non_gpib_address_is_not_present() {
        let backend = PrologixBackend::new(Default::default());
        let addr = ResourceAddress::parse("TCPIP::10.0.0.1::5025::SOCKET").unwrap();
        assert_eq!(
            backend.open(&addr, Duration::from_secs(1)).await,
            Err(OpenFailure::NotPresent)
        );
    }
}
