//! Rendering of results for the command line, either as plain lines or as
//! JSON records keyed by address.

use std::io::{self, Write};

use gpibtool_protocol::{AddressTable, Error, ErrorKind, ResultMap, ScpiResponse};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::json;

use crate::config::Config;
use crate::syntax;

/// Process exit status for a failed command.
pub fn exit_code(err: &Error) -> u8 {
    match err.kind() {
        ErrorKind::InvalidAddress => 2,
        ErrorKind::NotPresent | ErrorKind::BackendUnavailable => 3,
        ErrorKind::Timeout => 4,
        ErrorKind::PermissionDenied => 7,
        ErrorKind::BackendIo | ErrorKind::MalformedResponse | ErrorKind::Enumerate => 9,
        ErrorKind::NoResourcesFound => 12,
        ErrorKind::Busy => 13,
    }
}

pub fn error_record(err: &Error) -> serde_json::Value {
    json!({
        "kind": err.kind(),
        "address": err.address(),
        "message": err.to_string(),
    })
}

struct DictResults<'a>(&'a ResultMap);

impl Serialize for DictResults<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in self.0.iter() {
            match &entry.outcome {
                Ok(value) => map.serialize_entry(&entry.address, value)?,
                Err(err) => {
                    map.serialize_entry(&entry.address, &json!({ "error": error_record(err) }))?
                }
            }
        }
        map.end()
    }
}

pub struct Output<W> {
    out: W,
    dict: bool,
}

impl<W: Write> Output<W> {
    pub fn new(out: W, dict: bool) -> Self {
        Self { out, dict }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        writeln!(self.out)
    }

    pub fn addresses(&mut self, table: &AddressTable) -> io::Result<()> {
        for addr in table {
            if self.dict {
                self.json(addr)?;
            } else {
                writeln!(self.out, "{}", addr)?;
            }
        }
        Ok(())
    }

    /// A reply from a single instrument.
    pub fn value(&mut self, addr: &str, value: &str) -> io::Result<()> {
        if self.dict {
            self.json(&json!({ addr: value }))
        } else {
            writeln!(self.out, "{}", value)
        }
    }

    pub fn command(
        &mut self,
        addr: &str,
        command: &str,
        response: &ScpiResponse,
    ) -> io::Result<()> {
        let reply = match response {
            ScpiResponse::Done => None,
            ScpiResponse::String(x) => Some(x.as_str()),
        };
        if self.dict {
            return self.json(&json!({
                addr: { "command": command, "reply": reply }
            }));
        }
        match reply {
            Some(x) => writeln!(self.out, "{}", x),
            None => Ok(()),
        }
    }

    /// Results of a bulk query. Dict mode prints the whole map as one object.
    pub fn results(&mut self, map: &ResultMap) -> io::Result<()> {
        if self.dict {
            return self.json(&DictResults(map));
        }
        for entry in map.iter() {
            match &entry.outcome {
                Ok(value) => writeln!(self.out, "{}\t{}", entry.address, value)?,
                Err(err) => writeln!(self.out, "{}\terror: {}", entry.address, err)?,
            }
        }
        Ok(())
    }

    pub fn info(
        &mut self,
        backend: &str,
        config: &Config,
        resources: &Result<AddressTable, Error>,
    ) -> io::Result<()> {
        if self.dict {
            let resources = match resources {
                Ok(table) => json!(table.as_slice()),
                Err(err) => json!({ "error": error_record(err) }),
            };
            return self.json(&json!({
                "version": env!("CARGO_PKG_VERSION"),
                "backend": backend,
                "config": config,
                "resources": resources,
            }));
        }
        writeln!(self.out, "gpibtool {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(self.out, "backend: {}", backend)?;
        let config = toml::to_string_pretty(config)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        writeln!(self.out, "configuration:")?;
        for line in config.lines() {
            writeln!(self.out, "    {}", line)?;
        }
        match resources {
            Ok(table) => {
                writeln!(self.out, "resources:")?;
                for addr in table {
                    writeln!(self.out, "    {}", addr)?;
                }
                Ok(())
            }
            Err(err) => writeln!(self.out, "resources: {}", err),
        }
    }

    pub fn syntax(&mut self) -> io::Result<()> {
        if self.dict {
            let pairs = |xs: &[(&str, &str)]| {
                xs.iter()
                    .map(|(k, v)| json!({ "element": k, "description": v }))
                    .collect::<Vec<_>>()
            };
            return self.json(&json!({
                "notation": pairs(syntax::NOTATION),
                "addresses": pairs(syntax::ADDRESSES),
                "message_elements": pairs(syntax::MESSAGE_ELEMENTS),
                "command": syntax::COMMAND_FORM,
                "query": syntax::QUERY_FORMS,
            }));
        }
        let sections: [(&str, &[(&str, &str)]); 3] = [
            ("Notation", syntax::NOTATION),
            ("Addresses", syntax::ADDRESSES),
            ("Message elements", syntax::MESSAGE_ELEMENTS),
        ];
        for (title, items) in sections {
            writeln!(self.out, "{}:", title)?;
            for (k, v) in items {
                writeln!(self.out, "    {:<8} {}", k, v)?;
            }
            writeln!(self.out)?;
        }
        writeln!(self.out, "Command:\n    {}", syntax::COMMAND_FORM)?;
        writeln!(self.out, "Query:")?;
        for x in syntax::QUERY_FORMS {
            writeln!(self.out, "    {}", x)?;
        }
        Ok(())
    }
}
