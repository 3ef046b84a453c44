use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

pub mod address;
pub mod error;
pub mod scpi;

pub use crate::address::{HandleId, Interface, ResourceAddress};
pub use crate::error::{Error, ErrorKind, IoFailure, OpenFailure, Result};
pub use crate::scpi::{CommandMode, CommandRequest, ScpiResponse, IDN_QUERY};

/// The outcome of one command against one instrument, tagged with the
/// address it was sent to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub address: String,
    pub outcome: std::result::Result<String, Error>,
}

impl CommandResult {
    pub fn ok<A: Into<String>, T: Into<String>>(address: A, value: T) -> Self {
        Self {
            address: address.into(),
            outcome: Ok(value.into()),
        }
    }

    pub fn err<A: Into<String>>(address: A, err: Error) -> Self {
        Self {
            address: address.into(),
            outcome: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|x| x.as_str())
    }

    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }
}

/// Snapshot of the resources visible on the bus, in enumeration order.
/// Duplicate entries are dropped, keeping the first occurrence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTable {
    entries: Vec<String>,
}

impl AddressTable {
    pub fn new<I, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut ret = Self::default();
        for entry in entries {
            let entry: String = entry.into();
            let entry = entry.trim();
            if entry.is_empty() || ret.entries.iter().any(|x| x == entry) {
                continue;
            }
            ret.entries.push(entry.to_string());
        }
        ret
    }

    /// Drop serial (`ASRL...`) resources. Entries that do not parse are kept
    /// so they can be reported as invalid.
    pub fn without_serial(self) -> Self {
        let entries = self
            .entries
            .into_iter()
            .filter(|x| !ResourceAddress::parse(x).map_or(false, |addr| addr.is_serial()))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.entries
    }
}

impl IntoIterator for AddressTable {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a AddressTable {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Results of a bulk command, one entry per enumerated address, in
/// enumeration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultMap {
    entries: Vec<CommandResult>,
}

impl ResultMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append a result. An entry for the same address is replaced in place,
    /// keeping its original position.
    pub fn insert(&mut self, result: CommandResult) {
        match self.entries.iter_mut().find(|x| x.address == result.address) {
            Some(existing) => *existing = result,
            None => self.entries.push(result),
        }
    }

    pub fn get(&self, address: &str) -> Option<&CommandResult> {
        self.entries.iter().find(|x| x.address == address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|x| x.address.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommandResult> {
        self.entries.iter()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandResult> {
        self.entries.iter().filter(|x| !x.is_ok())
    }
}

impl FromIterator<CommandResult> for ResultMap {
    fn from_iter<I: IntoIterator<Item = CommandResult>>(iter: I) -> Self {
        let mut ret = ResultMap::new();
        for x in iter {
            ret.insert(x);
        }
        ret
    }
}

impl IntoIterator for ResultMap {
    type Item = CommandResult;
    type IntoIter = std::vec::IntoIter<CommandResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for ResultMap {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.address, &entry.outcome)?;
        }
        map.end()
    }
}
