use std::sync::Arc;
use std::time::Duration;

use gpibtool_protocol::{
    AddressTable, CommandRequest, Error, ResultMap, Result, ScpiResponse, IDN_QUERY,
};
use serde::{Deserialize, Serialize};

use crate::aggregator::Aggregator;
use crate::backend::Backend;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::resolver::Resolver;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ListAddresses,
    Idn(String),
    ListIdns,
    Scpi { addr: String, task: CommandRequest },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Response {
    Addresses(AddressTable),
    Idn { addr: String, idn: String },
    Idns(ResultMap),
    Scpi {
        addr: String,
        command: String,
        response: ScpiResponse,
    },
}

/// Binds a backend to the session, dispatch and bulk layers.
#[derive(Clone)]
pub struct App {
    resolver: Resolver,
    dispatcher: Dispatcher,
    aggregator: Aggregator,
    open_timeout: Duration,
    timeout: Duration,
}

impl App {
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        let resolver = Resolver::new(backend);
        let dispatcher = Dispatcher::new(config.dispatch_options());
        let aggregator = Aggregator::new(
            resolver.clone(),
            dispatcher.clone(),
            config.aggregator_options(),
        );
        Self {
            resolver,
            dispatcher,
            aggregator,
            open_timeout: config.open_timeout,
            timeout: config.timeout,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.resolver.backend().name()
    }

    /// Sessions currently held. Zero whenever no request is in flight.
    pub fn open_sessions(&self) -> usize {
        self.resolver.open_sessions()
    }

    pub async fn handle_request(&self, req: Request) -> Result<Response> {
        log::debug!("Incoming request: {:?}", req);
        match req {
            Request::ListAddresses => self.list_addresses().await.map(Response::Addresses),
            Request::Idn(addr) => {
                let idn = self.idn(&addr).await?;
                Ok(Response::Idn { addr, idn })
            }
            Request::ListIdns => self.list_idns().await.map(Response::Idns),
            Request::Scpi { addr, task } => {
                let response = self.command(&addr, &task).await?;
                Ok(Response::Scpi {
                    addr,
                    command: task.command,
                    response,
                })
            }
        }
    }

    /// Enumerate the bus. An empty bus is an error.
    pub async fn list_addresses(&self) -> Result<AddressTable> {
        let table = self.aggregator.enumerate().await?;
        if table.is_empty() {
            return Err(Error::NoResourcesFound);
        }
        Ok(table)
    }

    pub async fn idn(&self, addr: &str) -> Result<String> {
        self.command_query(addr, IDN_QUERY, None).await
    }

    /// `*IDN?` of every instrument on the bus. Per-instrument failures are
    /// part of the map.
    pub async fn list_idns(&self) -> Result<ResultMap> {
        self.aggregator.query_all(IDN_QUERY, self.timeout).await
    }

    pub async fn command_query(
        &self,
        addr: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut task = CommandRequest::query(command);
        task.timeout = timeout;
        if !task.has_query_header() {
            log::warn!("`{}` is not a query, the read will likely time out", command);
        }
        match self.command(addr, &task).await? {
            ScpiResponse::String(x) => Ok(x),
            ScpiResponse::Done => Ok(String::new()),
        }
    }

    pub async fn command_write(&self, addr: &str, command: &str) -> Result<()> {
        let task = CommandRequest::write(command);
        if task.has_query_header() {
            log::warn!("`{}` is a query, its reply is left unread", command);
        }
        self.command(addr, &task).await.map(|_| ())
    }

    async fn command(&self, addr: &str, task: &CommandRequest) -> Result<ScpiResponse> {
        let addr = self.resolver.validate(addr)?;
        let session = self.resolver.open(&addr, self.open_timeout).await?;
        let ret = self.dispatcher.execute(&session, task).await;
        self.resolver.close(session);
        ret
    }
}
