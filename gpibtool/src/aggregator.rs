//! Bulk operations across every instrument on the bus.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use gpibtool_protocol::{AddressTable, CommandResult, ResultMap, Result};

use crate::dispatcher::Dispatcher;
use crate::resolver::Resolver;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatorOptions {
    pub open_timeout: Duration,
    /// Upper bound of instruments queried at once. Only honoured by backends
    /// that support concurrent sessions.
    pub concurrency: usize,
    /// Keep serial (`ASRL`) resources in the enumeration.
    pub keep_serial: bool,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            open_timeout: crate::dispatcher::DEFAULT_TIMEOUT,
            concurrency: 1,
            keep_serial: false,
        }
    }
}

#[derive(Clone)]
pub struct Aggregator {
    resolver: Resolver,
    dispatcher: Dispatcher,
    options: AggregatorOptions,
}

impl Aggregator {
    pub fn new(resolver: Resolver, dispatcher: Dispatcher, options: AggregatorOptions) -> Self {
        Self {
            resolver,
            dispatcher,
            options,
        }
    }

    /// The resources visible on the bus. Serial ports are left out unless
    /// configured otherwise.
    pub async fn enumerate(&self) -> Result<AddressTable> {
        let table = self.resolver.enumerate().await?;
        if self.options.keep_serial {
            Ok(table)
        } else {
            Ok(table.without_serial())
        }
    }

    /// Enumerate the bus and send `command` to every instrument found.
    ///
    /// A failure on one instrument is recorded in its entry and does not stop
    /// the others. Only a failed enumeration fails the whole call.
    pub async fn query_all(&self, command: &str, timeout: Duration) -> Result<ResultMap> {
        let table = self.enumerate().await?;
        Ok(self.query_table(&table, command, timeout).await)
    }

    /// Send `command` to every entry of `table`. Results keep the order of the table.
    pub async fn query_table(
        &self,
        table: &AddressTable,
        command: &str,
        timeout: Duration,
    ) -> ResultMap {
        let width = self.width();
        log::debug!(
            "Sending `{}` to {} resources, {} at a time",
            command,
            table.len(),
            width
        );
        stream::iter(table.iter())
            .map(|raw| self.query_one(raw, command, timeout))
            .buffered(width)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect()
    }

    fn width(&self) -> usize {
        if self.resolver.backend().supports_concurrent_sessions() {
            self.options.concurrency.max(1)
        } else {
            1
        }
    }

    async fn query_one(&self, raw: &str, command: &str, timeout: Duration) -> CommandResult {
        let outcome: Result<String> = async {
            let addr = self.resolver.validate(raw)?;
            let session = self.resolver.open(&addr, self.options.open_timeout).await?;
            let ret = self.dispatcher.query(&session, command, timeout).await;
            session.close();
            ret
        }
        .await;
        match outcome {
            Ok(value) => CommandResult::ok(raw, value),
            Err(err) => {
                log::debug!("{}: {}", raw, err);
                CommandResult::err(raw, err)
            }
        }
    }
}
