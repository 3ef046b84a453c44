//! Backend on top of the system VISA library.
//!
//! VISA calls block, so every call runs on tokio's blocking pool. The VISA
//! I/O timeout is set before each transfer so a blocking read never outlives
//! the caller's deadline.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpibtool_protocol::{IoFailure, OpenFailure, ResourceAddress};
use parking_lot::Mutex;
use tokio::task::spawn_blocking;
use visa_rs::attribute::AttrTmoValue;
use visa_rs::enums::status::ErrorCode;
use visa_rs::prelude::*;

use crate::backend::{Backend, ReadChunk, SessionHandle};

const FIND_EXPRESSION: &str = "?*INSTR";
const READ_BUFFER_SIZE: usize = 4096;

type SharedInstrument = Arc<Mutex<Instrument>>;

pub struct VisaBackend {
    rm: Arc<DefaultRM>,
    write_timeout: Duration,
    sessions: Mutex<HashMap<SessionHandle, SharedInstrument>>,
    next_handle: AtomicU64,
}

impl VisaBackend {
    pub fn new(write_timeout: Duration) -> Result<Self, OpenFailure> {
        let rm = DefaultRM::new().map_err(|err| OpenFailure::BackendUnavailable(err.to_string()))?;
        Ok(Self {
            rm: Arc::new(rm),
            write_timeout,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn instrument(&self, session: SessionHandle) -> Result<SharedInstrument, IoFailure> {
        self.sessions
            .lock()
            .get(&session)
            .cloned()
            .ok_or_else(|| IoFailure::Backend(format!("invalid session {}", session)))
    }
}

fn visa_string(x: &str) -> Result<VisaString, String> {
    CString::new(x)
        .map(VisaString::from)
        .map_err(|err| err.to_string())
}

fn open_failure(err: visa_rs::Error) -> OpenFailure {
    match err.0 {
        ErrorCode::ErrorRsrcNfound => OpenFailure::NotPresent,
        ErrorCode::ErrorRsrcLocked | ErrorCode::ErrorRsrcBusy => OpenFailure::Busy,
        _ => OpenFailure::BackendUnavailable(err.to_string()),
    }
}

fn is_timeout(code: &ErrorCode) -> bool {
    matches!(code, ErrorCode::ErrorTmo)
}

// visa-rs wraps its status code into the io::Error of Read/Write
fn io_failure(err: io::Error) -> IoFailure {
    let code = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<visa_rs::Error>())
        .map(|inner| &inner.0);
    if err.kind() == io::ErrorKind::TimedOut || code.map_or(false, is_timeout) {
        IoFailure::Timeout
    } else {
        IoFailure::Backend(err.to_string())
    }
}

fn set_timeout(instrument: &Instrument, timeout: Duration) -> Result<(), IoFailure> {
    let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
    let attr = AttrTmoValue::new_checked(ms)
        .ok_or_else(|| IoFailure::Backend(format!("invalid VISA timeout {:?}", timeout)))?;
    instrument
        .set_attr(attr)
        .map_err(|err| IoFailure::Backend(err.to_string()))
}

#[async_trait]
impl Backend for VisaBackend {
    fn name(&self) -> &'static str {
        "visa"
    }

    fn supports_concurrent_sessions(&self) -> bool {
        true
    }

    async fn enumerate(&self) -> Result<Vec<String>, IoFailure> {
        let rm = self.rm.clone();
        let task = spawn_blocking(move || {
            let expr = visa_string(FIND_EXPRESSION).map_err(IoFailure::Backend)?;
            let mut list = match rm.find_res_list(&expr) {
                Ok(list) => list,
                // VISA reports an empty bus as an error
                Err(err) if err.0 == ErrorCode::ErrorRsrcNfound => return Ok(Vec::new()),
                Err(err) => return Err(IoFailure::Backend(err.to_string())),
            };
            let mut ret = Vec::new();
            while let Some(x) = list
                .find_next()
                .map_err(|err| IoFailure::Backend(err.to_string()))?
            {
                ret.push(x.to_string());
            }
            Ok(ret)
        });
        task.await
            .map_err(|err| IoFailure::Backend(err.to_string()))?
    }

    async fn open(
        &self,
        addr: &ResourceAddress,
        timeout: Duration,
    ) -> Result<SessionHandle, OpenFailure> {
        let rm = self.rm.clone();
        let resource = addr.to_string();
        let task = spawn_blocking(move || {
            let resource = visa_string(&resource).map_err(OpenFailure::BackendUnavailable)?;
            rm.open(&resource, AccessMode::NO_LOCK, timeout)
                .map_err(open_failure)
        });
        let instrument = task
            .await
            .map_err(|err| OpenFailure::BackendUnavailable(err.to_string()))??;
        let handle = SessionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .lock()
            .insert(handle, Arc::new(Mutex::new(instrument)));
        Ok(handle)
    }

    async fn write(&self, session: SessionHandle, data: &[u8]) -> Result<(), IoFailure> {
        let instrument = self.instrument(session)?;
        let data = data.to_vec();
        let timeout = self.write_timeout;
        let task = spawn_blocking(move || {
            let mut instrument = instrument.lock();
            set_timeout(&instrument, timeout)?;
            instrument.write_all(&data).map_err(io_failure)
        });
        task.await
            .map_err(|err| IoFailure::Backend(err.to_string()))?
    }

    async fn read(
        &self,
        session: SessionHandle,
        timeout: Duration,
    ) -> Result<ReadChunk, IoFailure> {
        let instrument = self.instrument(session)?;
        let task = spawn_blocking(move || {
            let mut instrument = instrument.lock();
            set_timeout(&instrument, timeout)?;
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            let n = instrument.read(&mut buf).map_err(io_failure)?;
            buf.truncate(n);
            // a full buffer means the message continues
            Ok(ReadChunk {
                end: n < READ_BUFFER_SIZE,
                data: buf,
            })
        });
        task.await
            .map_err(|err| IoFailure::Backend(err.to_string()))?
    }

    fn close(&self, session: SessionHandle) {
        // dropping the last reference closes the VISA session, a transfer
        // still running on the blocking pool ends within its VISA timeout
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visa_timeouts_are_classified() {
        let err = io::Error::new(io::ErrorKind::Other, visa_rs::Error(ErrorCode::ErrorTmo));
        assert_eq!(io_failure(err), IoFailure::Timeout);
        let err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert_eq!(io_failure(err), IoFailure::Timeout);
        let err = io::Error::new(io::ErrorKind::Other, "bus error");
        assert!(matches!(io_failure(err), IoFailure::Backend(_)));
    }
}
