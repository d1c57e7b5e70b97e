//! Applier-facing state machine abstractions.
//!
//! Identifiers, lifecycle enums, and the entry handle traits the Raft
//! applier implements when it feeds log entries into the session layer.

pub mod scheduler;

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::failure::Failure;

macro_rules! id_u64 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_u64! {
    /// Session identifier. Equals the Raft log index of the `OpenSession`
    /// entry that created the session.
    SessionId
}

id_u64! {
    /// Proposal identifier: the Raft log index of the entry. Retries of the
    /// same client sequence number keep the id of the first execution.
    ProposalId
}

id_u64! {
    /// Query identifier, assigned by the applier.
    QueryId
}

id_u64! {
    /// Identifier of a primitive instance hosted behind the adapter.
    PrimitiveId
}

impl From<ProposalId> for SessionId {
    fn from(id: ProposalId) -> Self {
        SessionId::new(id.get())
    }
}

/// Client-assigned input sequence number, or session-assigned output
/// sequence number. Zero means "none yet"; assigned values start at 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNum(u64);

impl SequenceNum {
    pub const ZERO: SequenceNum = SequenceNum(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Big-endian 8-byte encoding, the keep-alive filter key format.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for SequenceNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proposal lifecycle phase.
///
/// `Pending` is a reserved snapshot value: it is representable and survives
/// a snapshot round-trip but no transition ever produces it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    Canceled,
    Complete,
}

impl Phase {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Phase::Pending => 0,
            Phase::Running => 1,
            Phase::Canceled => 2,
            Phase::Complete => 3,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Phase::Pending,
            1 => Phase::Running,
            2 => Phase::Canceled,
            3 => Phase::Complete,
            _ => return None,
        })
    }
}

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

impl SessionState {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            SessionState::Open => 0,
            SessionState::Closed => 1,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => SessionState::Open,
            1 => SessionState::Closed,
            _ => return None,
        })
    }
}

/// Registration handle for a session-state or proposal-phase watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(Uuid);

impl WatcherId {
    pub(crate) fn next() -> Self {
        Self(Uuid::new_v4())
    }
}

/// An applier-supplied proposal entry handle.
///
/// The session layer replays cached outputs into it on retries and forwards
/// live primitive outputs through it. `close` and `cancel` conclude the
/// handle; the session layer calls each at most once per bound handle.
pub trait Proposal {
    type Input;
    type Output;

    fn id(&self) -> ProposalId;
    fn input(&self) -> &Self::Input;
    fn output(&mut self, output: Self::Output);
    fn error(&mut self, failure: Failure);
    fn close(&mut self);
    fn cancel(&mut self);
}

/// An applier-supplied query entry handle. Queries are not replicated
/// state: nothing is cached, nothing is snapshotted.
pub trait Query {
    type Input;
    type Output;

    fn id(&self) -> QueryId;
    fn input(&self) -> &Self::Input;
    fn output(&mut self, output: Self::Output);
    fn error(&mut self, failure: Failure);
    fn close(&mut self);
    fn cancel(&mut self);
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn duration_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
