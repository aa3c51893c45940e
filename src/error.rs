//! Top-level status and error types returned by the public API.
//!
//! `Status` is the terminal outcome of an operation — what a caller gets
//! back from `wait`, a completion callback, or a synchronous validation
//! failure. Each layer gets its own hand-rolled error enum
//! (`protocol::error::DecodeError`, `config::ConfigError`) rather than
//! pulling in `thiserror`.

use std::fmt;

use crate::protocol::{DecodeError, EncodeError};

/// Outcome of a connection-runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed as requested.
    Success,
    /// The operation is still in flight. Never returned from a terminal
    /// query (`wait`, a completion callback) — only from a non-blocking
    /// status peek while an operation is still queued or awaiting its ack.
    StatusPending,
    /// One-time setup (e.g. the serializer-override runtime) failed.
    InitFailed,
    /// A caller-supplied argument failed synchronous validation.
    BadParameter,
    /// A resource acquisition (buffer, operation slot) failed.
    NoMemory,
    /// The transport reported a send or receive failure.
    NetworkError,
    /// The task pool could not schedule a job.
    SchedulingError,
    /// The broker's response violated the protocol (bad packet, mismatched
    /// packet identifier, unexpected return code).
    BadResponse,
    /// A `timed_*` call's deadline elapsed with no response.
    Timeout,
    /// The broker explicitly refused the request (e.g. CONNACK return code,
    /// SUBACK failure code).
    ServerRefused,
    /// A QoS 1 publish exhausted its retry budget with no PUBACK.
    RetryNoResponse,
}

impl Status {
    /// Human-readable name, backing the public API's `strerror`-style
    /// accessor.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::StatusPending => "pending",
            Self::InitFailed => "init failed",
            Self::BadParameter => "bad parameter",
            Self::NoMemory => "no memory",
            Self::NetworkError => "network error",
            Self::SchedulingError => "scheduling error",
            Self::BadResponse => "bad response",
            Self::Timeout => "timeout",
            Self::ServerRefused => "server refused",
            Self::RetryNoResponse => "retry: no response",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type threaded through fallible runtime operations. Carries the same
/// kinds as [`Status`] plus the lower-level cause where there is one.
#[derive(Debug)]
pub enum Error {
    BadParameter(&'static str),
    NoMemory,
    NetworkError(std::io::Error),
    SchedulingError(&'static str),
    BadResponse(&'static str),
    Timeout,
    ServerRefused(&'static str),
    RetryNoResponse,
    InitFailed(&'static str),
}

impl Error {
    /// Maps this error onto the [`Status`] an operation should terminate
    /// with.
    pub fn status(&self) -> Status {
        match self {
            Self::BadParameter(_) => Status::BadParameter,
            Self::NoMemory => Status::NoMemory,
            Self::NetworkError(_) => Status::NetworkError,
            Self::SchedulingError(_) => Status::SchedulingError,
            Self::BadResponse(_) => Status::BadResponse,
            Self::Timeout => Status::Timeout,
            Self::ServerRefused(_) => Status::ServerRefused,
            Self::RetryNoResponse => Status::RetryNoResponse,
            Self::InitFailed(_) => Status::InitFailed,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadParameter(msg) => write!(f, "bad parameter: {msg}"),
            Self::NoMemory => write!(f, "no memory"),
            Self::NetworkError(e) => write!(f, "network error: {e}"),
            Self::SchedulingError(msg) => write!(f, "scheduling error: {msg}"),
            Self::BadResponse(msg) => write!(f, "bad response: {msg}"),
            Self::Timeout => write!(f, "timeout"),
            Self::ServerRefused(msg) => write!(f, "server refused: {msg}"),
            Self::RetryNoResponse => write!(f, "retry budget exhausted with no response"),
            Self::InitFailed(msg) => write!(f, "init failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NetworkError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::NetworkError(e)
    }
}

impl From<DecodeError> for Error {
    fn from(_: DecodeError) -> Self {
        Self::BadResponse("malformed packet from broker")
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::PacketTooLarge => Self::BadParameter("packet exceeds maximum size"),
            EncodeError::StringTooLong => Self::BadParameter("string exceeds maximum length"),
            EncodeError::InvalidTopicName => Self::BadParameter("invalid topic name"),
            EncodeError::TooManySubscriptions => Self::BadParameter("too many subscriptions"),
            EncodeError::BufferTooSmall => Self::NoMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_as_str_matches_kind() {
        assert_eq!(Status::Success.as_str(), "success");
        assert_eq!(Status::RetryNoResponse.as_str(), "retry: no response");
    }

    #[test]
    fn error_status_mapping_round_trips_kind() {
        assert_eq!(Error::Timeout.status(), Status::Timeout);
        assert_eq!(
            Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom")).status(),
            Status::NetworkError
        );
    }
}
