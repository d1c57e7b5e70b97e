//! Replicated failure records and the typed errors that map onto them.
//!
//! Failures ride inside proposal and query outputs; they are replicated
//! state, so their wire representation is fixed (see `session::proto`).

use std::fmt;

use thiserror::Error;

use crate::session::filter::FilterDecodeError;
use crate::statemachine::SessionId;

/// Status code carried by a [`Failure`] record.
///
/// Discriminants are part of the snapshot format and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureStatus {
    Error,
    Unknown,
    Canceled,
    NotFound,
    AlreadyExists,
    Unauthorized,
    Forbidden,
    Conflict,
    Invalid,
    Unavailable,
    NotSupported,
    Timeout,
    Fault,
    Internal,
}

impl FailureStatus {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            FailureStatus::Error => 0,
            FailureStatus::Unknown => 1,
            FailureStatus::Canceled => 2,
            FailureStatus::NotFound => 3,
            FailureStatus::AlreadyExists => 4,
            FailureStatus::Unauthorized => 5,
            FailureStatus::Forbidden => 6,
            FailureStatus::Conflict => 7,
            FailureStatus::Invalid => 8,
            FailureStatus::Unavailable => 9,
            FailureStatus::NotSupported => 10,
            FailureStatus::Timeout => 11,
            FailureStatus::Fault => 12,
            FailureStatus::Internal => 13,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => FailureStatus::Error,
            1 => FailureStatus::Unknown,
            2 => FailureStatus::Canceled,
            3 => FailureStatus::NotFound,
            4 => FailureStatus::AlreadyExists,
            5 => FailureStatus::Unauthorized,
            6 => FailureStatus::Forbidden,
            7 => FailureStatus::Conflict,
            8 => FailureStatus::Invalid,
            9 => FailureStatus::Unavailable,
            10 => FailureStatus::NotSupported,
            11 => FailureStatus::Timeout,
            12 => FailureStatus::Fault,
            13 => FailureStatus::Internal,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureStatus::Error => "ERROR",
            FailureStatus::Unknown => "UNKNOWN",
            FailureStatus::Canceled => "CANCELED",
            FailureStatus::NotFound => "NOT_FOUND",
            FailureStatus::AlreadyExists => "ALREADY_EXISTS",
            FailureStatus::Unauthorized => "UNAUTHORIZED",
            FailureStatus::Forbidden => "FORBIDDEN",
            FailureStatus::Conflict => "CONFLICT",
            FailureStatus::Invalid => "INVALID",
            FailureStatus::Unavailable => "UNAVAILABLE",
            FailureStatus::NotSupported => "NOT_SUPPORTED",
            FailureStatus::Timeout => "TIMEOUT",
            FailureStatus::Fault => "FAULT",
            FailureStatus::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicated failure record surfaced through proposal and query outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub status: FailureStatus,
    pub message: String,
}

impl Failure {
    pub fn new(status: FailureStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::Canceled, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::AlreadyExists, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::Forbidden, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::Invalid, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureStatus::Internal, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

/// Typed errors produced by the session layer itself.
///
/// Primitive state machines construct [`Failure`] records directly; the
/// session layer goes through this enum so each refusal has one canonical
/// status mapping.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    UnknownSession(SessionId),
    #[error("invalid request filter: {0}")]
    InvalidFilter(#[from] FilterDecodeError),
    #[error("deadline elapsed at {deadline_ms}ms (now {now_ms}ms)")]
    DeadlineElapsed { deadline_ms: u64, now_ms: u64 },
}

impl SessionError {
    pub fn status(&self) -> FailureStatus {
        match self {
            SessionError::UnknownSession(_) => FailureStatus::Forbidden,
            SessionError::InvalidFilter(_) => FailureStatus::Invalid,
            SessionError::DeadlineElapsed { .. } => FailureStatus::Canceled,
        }
    }
}

impl From<&SessionError> for Failure {
    fn from(err: &SessionError) -> Self {
        Failure::new(err.status(), err.to_string())
    }
}

impl From<SessionError> for Failure {
    fn from(err: SessionError) -> Self {
        Failure::from(&err)
    }
}
