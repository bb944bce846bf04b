//! Reply bodies produced by the bus and helpers for control payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome codes carried in `{"err":..,"errmsg":..}` reply bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// The request could not be parsed or applied.
    Failed,
    /// No service is registered under the header.
    ServiceNotFound,
    /// The pending request got no answer in time.
    RequestTimeout,
    /// A service is already registered under the header.
    DupService,
    /// The service missed its liveness deadline and was dropped.
    ServiceExpired,
    /// The topic has reached its subscriber bound.
    TooManySubscribers,
}

impl Status {
    /// Numeric code written as `err`.
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::Failed => 400,
            Self::ServiceNotFound => 404,
            Self::RequestTimeout => 408,
            Self::DupService => 409,
            Self::ServiceExpired => 410,
            Self::TooManySubscribers => 429,
        }
    }

    /// Text written as `errmsg`.
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::ServiceNotFound => "SERVICE NOT FOUND",
            Self::RequestTimeout => "REQUEST TIMEOUT",
            Self::DupService => "DUP SERVICE",
            Self::ServiceExpired => "SERVICE EXPIRED",
            Self::TooManySubscribers => "TOO MANY SUBSCRIBERS",
        }
    }

    /// Maps a numeric code back to a status.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            400 => Some(Self::Failed),
            404 => Some(Self::ServiceNotFound),
            408 => Some(Self::RequestTimeout),
            409 => Some(Self::DupService),
            410 => Some(Self::ServiceExpired),
            429 => Some(Self::TooManySubscribers),
            _ => None,
        }
    }

    /// Serialized reply body for this status.
    pub fn body(self) -> String {
        Reply::from(self).to_json()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A reply body as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Numeric status code.
    pub err: u16,
    /// Human-readable status.
    pub errmsg: String,
}

impl Reply {
    /// Parses a reply body; `None` if `data` is not one.
    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// The known status for this reply's code.
    pub const fn status(&self) -> Option<Status> {
        Status::from_code(self.err)
    }

    /// Serializes to compact JSON.
    pub fn to_json(&self) -> String {
        // A struct of a number and a string always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<Status> for Reply {
    fn from(s: Status) -> Self {
        Self {
            err: s.code(),
            errmsg: s.message().to_owned(),
        }
    }
}

/// Extracts the string at JSON pointer `path` (e.g. `/header`) from a
/// payload.
pub fn header_field(data: &[u8], path: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    value.pointer(path)?.as_str().map(str::to_owned)
}
