use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session could not be opened.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFailure {
    #[error("not present on the bus")]
    NotPresent,
    #[error("resource busy")]
    Busy,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("permission denied")]
    PermissionDenied,
}

/// Failure of a single write or read against an open session.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoFailure {
    #[error("timeout")]
    Timeout,
    #[error("backend I/O error: {0}")]
    Backend(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("cannot open {address}: {kind}")]
    Open { address: String, kind: OpenFailure },
    #[error("write to {address} failed: {kind}")]
    Write { address: String, kind: IoFailure },
    #[error("query on {address} failed: {kind}")]
    Query { address: String, kind: IoFailure },
    #[error("cannot enumerate resources: {0}")]
    Enumerate(IoFailure),
    #[error("no resources found")]
    NoResourcesFound,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Flat, machine-readable classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAddress,
    NotPresent,
    Busy,
    BackendUnavailable,
    PermissionDenied,
    Timeout,
    BackendIo,
    MalformedResponse,
    Enumerate,
    NoResourcesFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAddress => "invalid_address",
            ErrorKind::NotPresent => "not_present",
            ErrorKind::Busy => "busy",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BackendIo => "backend_io",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::Enumerate => "enumerate",
            ErrorKind::NoResourcesFound => "no_resources_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&OpenFailure> for ErrorKind {
    fn from(x: &OpenFailure) -> Self {
        match x {
            OpenFailure::NotPresent => ErrorKind::NotPresent,
            OpenFailure::Busy => ErrorKind::Busy,
            OpenFailure::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            OpenFailure::PermissionDenied => ErrorKind::PermissionDenied,
        }
    }
}

impl From<&IoFailure> for ErrorKind {
    fn from(x: &IoFailure) -> Self {
        match x {
            IoFailure::Timeout => ErrorKind::Timeout,
            IoFailure::Backend(_) => ErrorKind::BackendIo,
            IoFailure::MalformedResponse(_) => ErrorKind::MalformedResponse,
        }
    }
}

impl Error {
    pub fn invalid_address<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        Error::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn open<A: Into<String>>(address: A, kind: OpenFailure) -> Self {
        Error::Open {
            address: address.into(),
            kind,
        }
    }

    pub fn write<A: Into<String>>(address: A, kind: IoFailure) -> Self {
        Error::Write {
            address: address.into(),
            kind,
        }
    }

    pub fn query<A: Into<String>>(address: A, kind: IoFailure) -> Self {
        Error::Query {
            address: address.into(),
            kind,
        }
    }

    /// The address the failure originated from, if it concerns a single instrument.
    pub fn address(&self) -> Option<&str> {
        match self {
            Error::InvalidAddress { address, .. }
            | Error::Open { address, .. }
            | Error::Write { address, .. }
            | Error::Query { address, .. } => Some(address),
            Error::Enumerate(_) | Error::NoResourcesFound => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Error::Open { kind, .. } => kind.into(),
            Error::Write { kind, .. } | Error::Query { kind, .. } => kind.into(),
            Error::Enumerate(_) => ErrorKind::Enumerate,
            Error::NoResourcesFound => ErrorKind::NoResourcesFound,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
