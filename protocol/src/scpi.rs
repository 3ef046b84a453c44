use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The IEEE 488.2 identification query.
pub const IDN_QUERY: &str = "*IDN?";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    Write,
    Query,
}

/// A command to send to one instrument. A `timeout` of `None` means the
/// configured default applies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub mode: CommandMode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn write<T: Into<String>>(command: T) -> Self {
        Self {
            command: command.into(),
            mode: CommandMode::Write,
            timeout: None,
        }
    }

    pub fn query<T: Into<String>>(command: T) -> Self {
        Self {
            command: command.into(),
            mode: CommandMode::Query,
            timeout: None,
        }
    }

    pub fn idn() -> Self {
        Self::query(IDN_QUERY)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.mode == CommandMode::Query
    }

    /// Whether the command header ends with `?`, i.e. the instrument will
    /// answer it. Only the last header of a `;` separated message counts.
    pub fn has_query_header(&self) -> bool {
        self.command
            .rsplit(';')
            .next()
            .and_then(|msg| msg.split_whitespace().next())
            .map_or(false, |header| header.ends_with('?'))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScpiResponse {
    Done,
    String(String),
}
