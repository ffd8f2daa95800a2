//! RPC status codes delivered to transport, stream and resolver listeners.

use crate::error::TetherError;
use serde::Serialize;
use std::fmt;

/// Canonical status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    /// Numeric value used on the wire.
    pub fn value(self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::Cancelled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::NotFound => 5,
            Code::PermissionDenied => 7,
            Code::FailedPrecondition => 9,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
        }
    }

    /// Inverse of [`Code::value`]. Unrecognized values map to `Unknown`.
    pub fn from_value(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            5 => Code::NotFound,
            7 => Code::PermissionDenied,
            9 => Code::FailedPrecondition,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// A status code with an optional description and cause.
///
/// The cause is kept as rendered text, so two statuses built from the same
/// error compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    code: Code,
    description: Option<String>,
    cause: Option<String>,
}

impl Status {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            description: None,
            cause: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok)
    }

    pub fn cancelled() -> Self {
        Self::new(Code::Cancelled)
    }

    pub fn unavailable() -> Self {
        Self::new(Code::Unavailable)
    }

    pub fn internal() -> Self {
        Self::new(Code::Internal)
    }

    /// Convert an error into the status a listener should see.
    pub fn from_error(err: &TetherError) -> Self {
        Self::new(err.status_code()).with_cause(err)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_cause(mut self, cause: &TetherError) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}
