//! Replicated session state machine for the plinth multi-raft store.
//!
//! This crate sits between a Raft log applier and pluggable primitive
//! state machines. Clients open logical sessions against a partition;
//! every client command is proposed through Raft bound to a
//! (session, sequence number) pair, and this layer makes those commands
//! idempotent, linearizable, replayable, and snapshotable.
//!
//! The surrounding node owns Raft itself, transports, and the primitive
//! implementations; it drives [`session::SessionManager`] from the applier
//! thread and implements [`session::primitive::PrimitiveManager`] for each
//! primitive type.

#![forbid(unsafe_code)]

pub mod failure;
pub mod limits;
pub mod session;
pub mod snapshot;
pub mod statemachine;

pub use failure::{Failure, FailureStatus, SessionError};
pub use limits::Limits;
pub use session::{
    ProposalIndex, SessionManager, SessionProposalHandle, SessionQueryHandle, Sessions, TimerTask,
};
pub use snapshot::{
    Message, SnapshotDecodeError, SnapshotEncodeError, SnapshotReader, SnapshotWriter,
};
pub use statemachine::{
    Phase, PrimitiveId, Proposal, ProposalId, Query, QueryId, SequenceNum, SessionId, SessionState,
    WatcherId,
};
