//! A simulated bus of scripted instruments.
//!
//! Every instrument is described by a [`LoopbackInstrument`]: the resource string it
//! enumerates as, the replies it gives and an optional [`Fault`] it exhibits. The bus
//! counts every backend call and remembers how many sessions were open at once so
//! tests can check the session discipline of the layers above.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use gpibtool_protocol::{HandleId, IoFailure, OpenFailure, ResourceAddress, IDN_QUERY};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ReadChunk, SessionHandle};

const DEFAULT_CHUNK_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fault {
    /// Enumerated, but opening reports it as not present.
    Absent,
    Busy,
    PermissionDenied,
    Unavailable,
    /// Accepts commands but never answers.
    Timeout,
    IoError,
    /// Answers with bytes that are not valid UTF-8.
    Malformed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackInstrument {
    pub address: String,
    pub idn: Option<String>,
    pub responses: BTreeMap<String, String>,
    pub fault: Option<Fault>,
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
}

impl LoopbackInstrument {
    pub fn new<T: Into<String>>(address: T) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_idn<T: Into<String>>(mut self, idn: T) -> Self {
        self.idn = Some(idn.into());
        self
    }

    pub fn with_response<C: Into<String>, R: Into<String>>(mut self, command: C, reply: R) -> Self {
        self.responses.insert(command.into(), reply.into());
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Wait `delay` before delivering a reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn handle_id(&self) -> Option<HandleId> {
        ResourceAddress::parse(&self.address)
            .ok()
            .map(|x| x.handle_id())
    }

    fn reply_to(&self, command: &str) -> Option<String> {
        if let Some(reply) = self.responses.get(command) {
            return Some(reply.clone());
        }
        if command.eq_ignore_ascii_case(IDN_QUERY) {
            return self.idn.clone();
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub instruments: Vec<LoopbackInstrument>,
    pub concurrent: bool,
    pub chunk_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            concurrent: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub enumerate: usize,
    pub open: usize,
    pub write: usize,
    pub read: usize,
    pub close: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.enumerate + self.open + self.write + self.read + self.close
    }
}

struct OpenSession {
    instrument: usize,
    id: HandleId,
    pending: Vec<u8>,
}

#[derive(Default)]
struct BusState {
    next_handle: u64,
    sessions: HashMap<SessionHandle, OpenSession>,
    calls: CallCounts,
    double_opens: usize,
    max_open: usize,
    written: Vec<(String, String)>,
}

pub struct LoopbackBus {
    instruments: Vec<LoopbackInstrument>,
    concurrent: bool,
    chunk_size: usize,
    state: Mutex<BusState>,
}

impl LoopbackBus {
    pub fn new(instruments: Vec<LoopbackInstrument>) -> Self {
        Self {
            instruments,
            concurrent: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn from_config(config: &LoopbackConfig) -> Self {
        Self::new(config.instruments.clone())
            .with_concurrent_sessions(config.concurrent)
            .with_chunk_size(config.chunk_size)
    }

    pub fn with_concurrent_sessions(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Deliver replies in pieces of at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of times a session was requested for an address that already had one.
    pub fn double_opens(&self) -> usize {
        self.state.lock().double_opens
    }

    /// Highest number of sessions that were open at the same time.
    pub fn max_open_sessions(&self) -> usize {
        self.state.lock().max_open
    }

    /// Messages written so far, as `(address, message)`.
    pub fn written(&self) -> Vec<(String, String)> {
        self.state.lock().written.clone()
    }

    fn find(&self, addr: &ResourceAddress) -> Option<usize> {
        let id = addr.handle_id();
        self.instruments
            .iter()
            .position(|x| x.handle_id().as_ref() == Some(&id))
    }
}

#[async_trait]
impl Backend for LoopbackBus {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn supports_concurrent_sessions(&self) -> bool {
        self.concurrent
    }

    async fn enumerate(&self) -> Result<Vec<String>, IoFailure> {
        self.state.lock().calls.enumerate += 1;
        Ok(self.instruments.iter().map(|x| x.address.clone()).collect())
    }

    async fn open(
        &self,
        addr: &ResourceAddress,
        _timeout: Duration,
    ) -> Result<SessionHandle, OpenFailure> {
        let mut state = self.state.lock();
        state.calls.open += 1;
        let idx = self.find(addr).ok_or(OpenFailure::NotPresent)?;
        match self.instruments[idx].fault {
            Some(Fault::Absent) => return Err(OpenFailure::NotPresent),
            Some(Fault::Busy) => return Err(OpenFailure::Busy),
            Some(Fault::PermissionDenied) => return Err(OpenFailure::PermissionDenied),
            Some(Fault::Unavailable) => {
                return Err(OpenFailure::BackendUnavailable(
                    "loopback driver offline".to_string(),
                ))
            }
            _ => {}
        }
        let id = addr.handle_id();
        if state.sessions.values().any(|x| x.id == id) {
            state.double_opens += 1;
            return Err(OpenFailure::Busy);
        }
        state.next_handle += 1;
        let handle = SessionHandle::new(state.next_handle);
        state.sessions.insert(
            handle,
            OpenSession {
                instrument: idx,
                id,
                pending: Vec::new(),
            },
        );
        state.max_open = state.max_open.max(state.sessions.len());
        Ok(handle)
    }

    async fn write(&self, session: SessionHandle, data: &[u8]) -> Result<(), IoFailure> {
        let mut state = self.state.lock();
        state.calls.write += 1;
        let state = &mut *state;
        let open = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| IoFailure::Backend(format!("invalid session {}", session)))?;
        let instrument = &self.instruments[open.instrument];
        if instrument.fault == Some(Fault::IoError) {
            return Err(IoFailure::Backend("bus error".to_string()));
        }
        let message = String::from_utf8_lossy(data);
        let command = message.trim_end_matches(|x| x == '\r' || x == '\n');
        state
            .written
            .push((instrument.address.clone(), command.to_string()));
        if instrument.fault == Some(Fault::Malformed) {
            open.pending = vec![0xFF, 0xFE, b'\n'];
        } else if let Some(reply) = instrument.reply_to(command) {
            open.pending = format!("{}\n", reply).into_bytes();
        }
        Ok(())
    }

    async fn read(
        &self,
        session: SessionHandle,
        timeout: Duration,
    ) -> Result<ReadChunk, IoFailure> {
        let (chunk, fault, delay) = {
            let mut state = self.state.lock();
            state.calls.read += 1;
            let open = state
                .sessions
                .get_mut(&session)
                .ok_or_else(|| IoFailure::Backend(format!("invalid session {}", session)))?;
            let instrument = &self.instruments[open.instrument];
            let n = self.chunk_size.min(open.pending.len());
            let chunk: Vec<u8> = open.pending.drain(..n).collect();
            let end = open.pending.is_empty();
            (ReadChunk { data: chunk, end }, instrument.fault, instrument.delay)
        };
        match fault {
            Some(Fault::Timeout) => futures::future::pending().await,
            Some(Fault::IoError) => return Err(IoFailure::Backend("bus error".to_string())),
            _ => {}
        }
        if chunk.data.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(IoFailure::Timeout);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(chunk)
    }

    fn close(&self, session: SessionHandle) {
        let mut state = self.state.lock();
        state.calls.close += 1;
        state.sessions.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(x: &str) -> ResourceAddress {
        ResourceAddress::parse(x).unwrap()
    }

    #[tokio::test]
    async fn scripted_reply_in_chunks() {
        let bus = LoopbackBus::new(vec![LoopbackInstrument::new("GPIB0::6::INSTR")
            .with_idn("KEITHLEY INSTRUMENTS INC.,MODEL 2000")])
        .with_chunk_size(8);

        let handle = bus
            .open(&addr("GPIB::6"), Duration::from_secs(1))
            .await
            .unwrap();
        bus.write(handle, b"*IDN?\n").await.unwrap();

        let mut reply = Vec::new();
        loop {
            let chunk = bus.read(handle, Duration::from_secs(1)).await.unwrap();
            assert!(chunk.data.len() <= 8);
            reply.extend(chunk.data);
            if chunk.end {
                break;
            }
        }
        assert_eq!(reply, b"KEITHLEY INSTRUMENTS INC.,MODEL 2000\n");
        bus.close(handle);
        assert_eq!(bus.open_sessions(), 0);
        assert_eq!(
            bus.written(),
            vec![("GPIB0::6::INSTR".to_string(), "*IDN?".to_string())]
        );
    }

    #[tokio::test]
    async fn open_faults() {
        let bus = LoopbackBus::new(vec![
            LoopbackInstrument::new("GPIB0::1::INSTR").with_fault(Fault::Busy),
            LoopbackInstrument::new("GPIB0::2::INSTR").with_fault(Fault::PermissionDenied),
            LoopbackInstrument::new("GPIB0::3::INSTR").with_fault(Fault::Absent),
        ]);
        let timeout = Duration::from_secs(1);
        assert_eq!(
            bus.open(&addr("GPIB0::1::INSTR"), timeout).await,
            Err(OpenFailure::Busy)
        );
        assert_eq!(
            bus.open(&addr("GPIB0::2::INSTR"), timeout).await,
            Err(OpenFailure::PermissionDenied)
        );
        assert_eq!(
            bus.open(&addr("GPIB0::3::INSTR"), timeout).await,
            Err(OpenFailure::NotPresent)
        );
        assert_eq!(
            bus.open(&addr("GPIB0::4::INSTR"), timeout).await,
            Err(OpenFailure::NotPresent)
        );
        assert_eq!(bus.open_sessions(), 0);
        assert_eq!(bus.calls().open, 4);
    }

    #[tokio::test]
    async fn second_open_is_counted() {
        let bus = LoopbackBus::new(vec![LoopbackInstrument::new("GPIB0::6::INSTR")]);
        let timeout = Duration::from_secs(1);
        let first = bus.open(&addr("GPIB0::6::INSTR"), timeout).await.unwrap();
        assert_eq!(
            bus.open(&addr("GPIB0::6::INSTR"), timeout).await,
            Err(OpenFailure::Busy)
        );
        assert_eq!(bus.double_opens(), 1);
        bus.close(first);
        bus.close(first);
        assert_eq!(bus.open_sessions(), 0);
        assert_eq!(bus.max_open_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instrument_times_out() {
        let bus = LoopbackBus::new(vec![LoopbackInstrument::new("GPIB0::6::INSTR")]);
        let handle = bus
            .open(&addr("GPIB0::6::INSTR"), Duration::from_secs(1))
            .await
            .unwrap();
        bus.write(handle, b"*RST\n").await.unwrap();
        let ret = bus.read(handle, Duration::from_millis(100)).await;
        assert_eq!(ret, Err(IoFailure::Timeout));
    }

    #[test]
    fn config_from_toml() {
        let config: LoopbackConfig = toml::from_str(
            r#"
            concurrent = true

            [[instruments]]
            address = "GPIB0::6::INSTR"
            idn = "KEITHLEY"
            delay = "50ms"

            [instruments.responses]
            "MEAS:VOLT?" = "+1.000E+00"

            [[instruments]]
            address = "GPIB0::1::INSTR"
            fault = "permission-denied"
            "#,
        )
        .unwrap();
        assert!(config.concurrent);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.instruments[0].delay, Some(Duration::from_millis(50)));
        assert_eq!(
            config.instruments[0].reply_to("MEAS:VOLT?").as_deref(),
            Some("+1.000E+00")
        );
        assert_eq!(config.instruments[0].reply_to("*idn?").as_deref(), Some("KEITHLEY"));
        assert_eq!(config.instruments[1].fault, Some(Fault::PermissionDenied));
    }
}
