//! The contract a primitive-type state machine satisfies.

use crate::snapshot::{SnapshotDecodeError, SnapshotEncodeError, SnapshotReader, SnapshotWriter};

use super::proposal::{
    ClosePrimitiveProposal, CreatePrimitiveProposal, PrimitiveProposal, PrimitiveQuery,
};

/// Everything the session manager requires of a primitive implementation.
///
/// Each method must be a deterministic function of prior primitive state,
/// the handle's input, and the manager's logical time. `propose` may emit
/// zero or more outputs and either close the handle or leave it open as a
/// stream; `query` emits its outputs and closes before returning.
/// `snapshot` and `recover` are symmetric: whatever one writes after the
/// manager's own blocks, the other consumes.
pub trait PrimitiveManager {
    fn create_primitive(&mut self, proposal: CreatePrimitiveProposal<'_>);
    fn close_primitive(&mut self, proposal: ClosePrimitiveProposal<'_>);
    fn propose(&mut self, proposal: PrimitiveProposal<'_>);
    fn query(&mut self, query: PrimitiveQuery<'_>);
    fn snapshot(&mut self, writer: &mut SnapshotWriter<'_>) -> Result<(), SnapshotEncodeError>;
    fn recover(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotDecodeError>;
}
