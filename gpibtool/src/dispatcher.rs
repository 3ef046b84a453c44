//! Sends SCPI commands over an open session and collects the replies.

use std::time::Duration;

use gpibtool_protocol::{CommandRequest, Error, IoFailure, Result, ScpiResponse};
use tokio::time::{self, Instant};

use crate::inventory::Session;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a read that returned nothing before asking the backend again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOptions {
    pub timeout: Duration,
    pub write_termination: String,
    pub read_termination: String,
    /// Log every message on the wire at trace level.
    pub trace_io: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            write_termination: "\n".to_string(),
            read_termination: "\n".to_string(),
            trace_io: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Dispatcher {
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Send `command` without waiting for a reply.
    pub async fn write(&self, session: &Session, command: &str) -> Result<()> {
        self.send(session, command)
            .await
            .map_err(|kind| Error::write(session.address().to_string(), kind))
    }

    /// Send `command` and return the reply with trailing whitespace removed.
    ///
    /// The read phase never takes longer than `timeout`, regardless of how the
    /// backend behaves.
    pub async fn query(
        &self,
        session: &Session,
        command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let addr = session.address().to_string();
        self.send(session, command)
            .await
            .map_err(|kind| Error::query(&addr, kind))?;
        let raw = match time::timeout(timeout, self.read_message(session, timeout)).await {
            Ok(ret) => ret.map_err(|kind| Error::query(&addr, kind))?,
            Err(_) => {
                log::debug!("{}: no reply within {:?}", addr, timeout);
                return Err(Error::query(&addr, IoFailure::Timeout));
            }
        };
        self.decode(raw).map_err(|kind| Error::query(&addr, kind))
    }

    pub async fn execute(
        &self,
        session: &Session,
        request: &CommandRequest,
    ) -> Result<ScpiResponse> {
        if request.expects_reply() {
            let timeout = request.timeout.unwrap_or(self.options.timeout);
            let reply = self.query(session, &request.command, timeout).await?;
            Ok(ScpiResponse::String(reply))
        } else {
            self.write(session, &request.command).await?;
            Ok(ScpiResponse::Done)
        }
    }

    async fn send(&self, session: &Session, command: &str) -> std::result::Result<(), IoFailure> {
        let mut msg = command.to_string();
        let term = &self.options.write_termination;
        if !msg.ends_with(term.as_str()) {
            msg.push_str(term);
        }
        if self.options.trace_io {
            log::trace!("{} <- {:?}", session.address(), msg);
        }
        session.backend().write(session.handle(), msg.as_bytes()).await
    }

    async fn read_message(
        &self,
        session: &Session,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, IoFailure> {
        let term = self.options.read_termination.as_bytes();
        let deadline = Instant::now() + timeout;
        let mut ret = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(IoFailure::Timeout);
            }
            let chunk = session.backend().read(session.handle(), remaining).await?;
            if self.options.trace_io {
                log::trace!("{} -> {:?}", session.address(), String::from_utf8_lossy(&chunk.data));
            }
            if chunk.data.is_empty() && !chunk.end {
                time::sleep(POLL_INTERVAL.min(remaining)).await;
                continue;
            }
            ret.extend_from_slice(&chunk.data);
            if chunk.end || (!term.is_empty() && ret.ends_with(term)) {
                return Ok(ret);
            }
        }
    }

    fn decode(&self, mut raw: Vec<u8>) -> std::result::Result<String, IoFailure> {
        let term = self.options.read_termination.as_bytes();
        if !term.is_empty() && raw.ends_with(term) {
            raw.truncate(raw.len() - term.len());
        }
        let text =
            String::from_utf8(raw).map_err(|err| IoFailure::MalformedResponse(err.to_string()))?;
        Ok(text.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::loopback::{Fault, LoopbackBus, LoopbackInstrument};
    use crate::backend::{Backend, ReadChunk, SessionHandle};
    use crate::resolver::Resolver;
    use gpibtool_protocol::{ErrorKind, OpenFailure, ResourceAddress};

    /// Answers every read with an empty chunk until `empty_reads` is used up.
    struct Trickle {
        empty_reads: usize,
        reply: Option<&'static str>,
        reads: AtomicUsize,
    }

    impl Trickle {
        fn new(empty_reads: usize, reply: Option<&'static str>) -> Self {
            Self {
                empty_reads,
                reply,
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for Trickle {
        fn name(&self) -> &'static str {
            "trickle"
        }

        async fn enumerate(&self) -> std::result::Result<Vec<String>, IoFailure> {
            Ok(vec!["GPIB0::1::INSTR".to_string()])
        }

        async fn open(
            &self,
            _addr: &ResourceAddress,
            _timeout: Duration,
        ) -> std::result::Result<SessionHandle, OpenFailure> {
            Ok(SessionHandle::new(1))
        }

        async fn write(
            &self,
            _session: SessionHandle,
            _data: &[u8],
        ) -> std::result::Result<(), IoFailure> {
            Ok(())
        }

        async fn read(
            &self,
            _session: SessionHandle,
            _timeout: Duration,
        ) -> std::result::Result<ReadChunk, IoFailure> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Some(reply) if n >= self.empty_reads => Ok(ReadChunk::last(reply.into())),
                _ => Ok(ReadChunk::more(Vec::new())),
            }
        }

        fn close(&self, _session: SessionHandle) {}
    }

    async fn open(bus: &Arc<LoopbackBus>, addr: &str) -> (Resolver, Session) {
        let resolver = Resolver::new(bus.clone());
        let addr = resolver.validate(addr).unwrap();
        let session = resolver.open(&addr, DEFAULT_TIMEOUT).await.unwrap();
        (resolver, session)
    }

    async fn open_trickle(backend: &Arc<Trickle>) -> (Resolver, Session) {
        let resolver = Resolver::new(backend.clone());
        let addr = resolver.validate("GPIB0::1::INSTR").unwrap();
        let session = resolver.open(&addr, DEFAULT_TIMEOUT).await.unwrap();
        (resolver, session)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reads_wait_between_polls() {
        let backend = Arc::new(Trickle::new(usize::MAX, None));
        let (_resolver, session) = open_trickle(&backend).await;
        let ret = time::timeout(
            Duration::from_secs(5),
            Dispatcher::default().query(&session, "*IDN?", Duration::from_millis(100)),
        )
        .await
        .expect("query must finish within its own timeout");
        assert_eq!(
            ret.unwrap_err(),
            Error::query("GPIB0::1::INSTR", IoFailure::Timeout)
        );
        let reads = backend.reads.load(Ordering::SeqCst);
        assert!(reads > 1 && reads <= 11, "{} reads", reads);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_empty_reads() {
        let backend = Arc::new(Trickle::new(3, Some("1.5\n")));
        let (_resolver, session) = open_trickle(&backend).await;
        let ret = Dispatcher::default()
            .query(&session, "MEAS?", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ret, "1.5");
        assert_eq!(backend.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn query_strips_trailing_whitespace() {
        let bus = Arc::new(
            LoopbackBus::new(vec![LoopbackInstrument::new("GPIB0::6::INSTR")
                .with_idn("KEITHLEY INSTRUMENTS INC.,MODEL 2000,0,A02  \r")
                .with_response("MEAS:VOLT?", "+1.00000000E+00")])
            .with_chunk_size(4),
        );
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let dispatcher = Dispatcher::default();

        let idn = dispatcher.query(&session, "*IDN?", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(idn, "KEITHLEY INSTRUMENTS INC.,MODEL 2000,0,A02");

        let volt = dispatcher
            .query(&session, "MEAS:VOLT?", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(volt, "+1.00000000E+00");
        assert!(bus.calls().read > 2);
    }

    #[tokio::test]
    async fn write_appends_termination_and_never_reads() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_idn("KEITHLEY")]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let dispatcher = Dispatcher::default();

        dispatcher.write(&session, "*RST").await.unwrap();
        dispatcher.write(&session, "*CLS\n").await.unwrap();
        assert_eq!(bus.calls().write, 2);
        assert_eq!(bus.calls().read, 0);
        assert_eq!(
            bus.written(),
            vec![
                ("GPIB0::6::INSTR".to_string(), "*RST".to_string()),
                ("GPIB0::6::INSTR".to_string(), "*CLS".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_instrument_times_out() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_fault(Fault::Timeout)]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let dispatcher = Dispatcher::default();

        let err = dispatcher
            .query(&session, "*IDN?", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err, Error::query("GPIB0::6::INSTR", IoFailure::Timeout));
    }

    #[tokio::test]
    async fn invalid_utf8_is_malformed() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_fault(Fault::Malformed)]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let err = Dispatcher::default()
            .query(&session, "*IDN?", DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn write_failure_is_reported_as_write() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_fault(Fault::IoError)]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let err = Dispatcher::default().write(&session, "*RST").await.unwrap_err();
        assert_eq!(
            err,
            Error::write("GPIB0::6::INSTR", IoFailure::Backend("bus error".to_string()))
        );
    }

    #[tokio::test]
    async fn execute_dispatches_on_mode() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_idn("KEITHLEY")]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let dispatcher = Dispatcher::default();

        let ret = dispatcher
            .execute(&session, &CommandRequest::write("*RST"))
            .await
            .unwrap();
        assert_eq!(ret, ScpiResponse::Done);

        let ret = dispatcher
            .execute(&session, &CommandRequest::idn())
            .await
            .unwrap();
        assert_eq!(ret, ScpiResponse::String("KEITHLEY".to_string()));
    }

    #[tokio::test]
    async fn custom_read_termination() {
        let bus = Arc::new(LoopbackBus::new(vec![LoopbackInstrument::new(
            "GPIB0::6::INSTR",
        )
        .with_response("DATA?", "1,2,3;")]));
        let (_resolver, session) = open(&bus, "GPIB0::6::INSTR").await;
        let dispatcher = Dispatcher::new(DispatchOptions {
            read_termination: ";\n".to_string(),
            ..Default::default()
        });
        let ret = dispatcher.query(&session, "DATA?", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(ret, "1,2,3");
    }
}
