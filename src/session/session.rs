//! Per-session state: open proposals, cached outputs, expiration.
//!
//! A session owns its proposals by value. The registry owns sessions; the
//! global primitive-proposal index holds ids only, so every mutation goes
//! through exactly one owner.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::failure::{Failure, SessionError};
use crate::snapshot::{SnapshotDecodeError, SnapshotEncodeError, SnapshotReader, SnapshotWriter};
use crate::statemachine::scheduler::{Scheduler, TimerHandle};
use crate::statemachine::{
    duration_to_ms, Phase, Proposal, ProposalId, SequenceNum, SessionId, SessionState, WatcherId,
};

use super::filter::InputFilter;
use super::primitive::PrimitiveManager;
use super::proposal::{ClosePrimitiveProposal, CreatePrimitiveProposal, PrimitiveProposal};
use super::proto::{
    KeepAliveInput, KeepAliveOutput, ProposalInputKind, ProposalOutputBody, SessionProposalInput,
    SessionProposalOutput, SessionProposalSnapshot, SessionSnapshot,
};
use super::{ProposalIndex, SessionProposalHandle, TimerTask};

/// One client session and everything it owns.
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) timeout: Duration,
    pub(crate) last_updated_ms: u64,
    /// Open and replayable proposals keyed by client sequence number.
    /// Complete/Canceled proposals stay here for replay until a keep-alive
    /// evicts them.
    pub(crate) session_proposals: BTreeMap<SequenceNum, SessionProposal>,
    /// Projection of the Running primitive proposals by Raft index.
    pub(crate) primitive_proposals: BTreeMap<ProposalId, SequenceNum>,
    pub(crate) watchers: BTreeMap<WatcherId, Box<dyn FnMut(SessionState)>>,
    pub(crate) expire_timer: Option<TimerHandle>,
}

impl Session {
    pub(crate) fn new(id: SessionId, timeout: Duration, now_ms: u64) -> Self {
        Self {
            id,
            state: SessionState::Open,
            timeout,
            last_updated_ms: now_ms,
            session_proposals: BTreeMap::new(),
            primitive_proposals: BTreeMap::new(),
            watchers: BTreeMap::new(),
            expire_timer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_updated_ms(&self) -> u64 {
        self.last_updated_ms
    }

    /// Raft indexes of the Running primitive proposals owned by this
    /// session, ascending.
    pub fn primitive_proposal_ids(&self) -> impl Iterator<Item = ProposalId> + '_ {
        self.primitive_proposals.keys().copied()
    }

    /// Phase of the proposal with the given client sequence number, if it
    /// has not been evicted.
    pub fn proposal_phase(&self, sequence_num: SequenceNum) -> Option<Phase> {
        self.session_proposals
            .get(&sequence_num)
            .map(|proposal| proposal.phase)
    }

    /// Register a watcher fired exactly once when the session closes.
    pub fn watch(&mut self, watcher: impl FnMut(SessionState) + 'static) -> WatcherId {
        let id = WatcherId::next();
        self.watchers.insert(id, Box::new(watcher));
        id
    }

    pub fn unwatch(&mut self, watcher: WatcherId) {
        self.watchers.remove(&watcher);
    }

    pub(crate) fn schedule_expire(&mut self, scheduler: &mut Scheduler<TimerTask>) {
        if let Some(timer) = self.expire_timer.take() {
            scheduler.cancel(timer);
        }
        let expire_at_ms = self
            .last_updated_ms
            .saturating_add(duration_to_ms(self.timeout));
        self.expire_timer =
            Some(scheduler.schedule(expire_at_ms, TimerTask::ExpireSession(self.id)));
        tracing::debug!(
            session = self.id.get(),
            expire_at_ms,
            "scheduled session expiration"
        );
    }

    pub(crate) fn propose<P: PrimitiveManager>(
        &mut self,
        parent: SessionProposalHandle,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
        primitives: &mut P,
    ) {
        let sequence_num = parent.input().sequence_num;
        if self.session_proposals.contains_key(&sequence_num) {
            self.replay(sequence_num, parent);
        } else {
            self.execute(parent, index, scheduler, primitives);
        }
    }

    /// Re-deliver the cached outputs of an existing proposal to a freshly
    /// bound parent handle. The primitive adapter is never re-invoked.
    fn replay(&mut self, sequence_num: SequenceNum, mut parent: SessionProposalHandle) {
        let Some(proposal) = self.session_proposals.get_mut(&sequence_num) else {
            return;
        };
        if !proposal.outputs.is_empty() {
            tracing::debug!(
                session = self.id.get(),
                proposal = proposal.id.get(),
                outputs = proposal.outputs.len(),
                "replaying proposal outputs"
            );
            for output in &proposal.outputs {
                parent.output(output.clone());
            }
        }
        match proposal.phase {
            Phase::Complete => parent.close(),
            Phase::Canceled => parent.cancel(),
            Phase::Running | Phase::Pending => {}
        }
        proposal.parent = Some(parent);
    }

    fn execute<P: PrimitiveManager>(
        &mut self,
        parent: SessionProposalHandle,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
        primitives: &mut P,
    ) {
        let id = parent.id();
        let input = parent.input().clone();
        let sequence_num = input.sequence_num;
        tracing::debug!(
            session = self.id.get(),
            proposal = id.get(),
            sequence_num = sequence_num.get(),
            "executing proposal"
        );

        let mut proposal = SessionProposal::new(id, input.clone());
        if let Some(deadline_ms) = input.deadline_ms {
            proposal.deadline_timer = Some(scheduler.schedule(
                deadline_ms,
                TimerTask::CancelProposal {
                    session_id: self.id,
                    sequence_num,
                },
            ));
        }
        proposal.parent = Some(parent);
        self.session_proposals.insert(sequence_num, proposal);

        let trapped = match &input.input {
            ProposalInputKind::Proposal(_) => {
                self.primitive_proposals.insert(id, sequence_num);
                index.insert(id, self.id, sequence_num);
                catch_unwind(AssertUnwindSafe(|| {
                    primitives.propose(PrimitiveProposal::new(self, index, scheduler, sequence_num));
                }))
            }
            ProposalInputKind::CreatePrimitive(_) => catch_unwind(AssertUnwindSafe(|| {
                primitives.create_primitive(CreatePrimitiveProposal::new(
                    self,
                    index,
                    scheduler,
                    sequence_num,
                ));
            })),
            ProposalInputKind::ClosePrimitive(_) => catch_unwind(AssertUnwindSafe(|| {
                primitives.close_primitive(ClosePrimitiveProposal::new(
                    self,
                    index,
                    scheduler,
                    sequence_num,
                ));
            })),
        };
        if trapped.is_err() {
            tracing::error!(
                session = self.id.get(),
                proposal = id.get(),
                "primitive state machine panicked; trapped as INTERNAL failure"
            );
            self.push_output(
                sequence_num,
                ProposalOutputBody::Failure(Failure::internal(
                    "primitive state machine panicked",
                )),
            );
            self.finish_proposal(sequence_num, Phase::Complete, index, scheduler);
        }
    }

    pub(crate) fn keep_alive(
        &mut self,
        parent: &mut dyn Proposal<Input = KeepAliveInput, Output = KeepAliveOutput>,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
        limits: &crate::limits::Limits,
    ) {
        let input = parent.input().clone();
        let filter = match InputFilter::decode(&input.input_filter, limits) {
            Ok(filter) => filter,
            Err(err) => {
                tracing::warn!(
                    session = self.id.get(),
                    "failed to decode request filter: {err}"
                );
                parent.error(Failure::from(SessionError::InvalidFilter(err)));
                parent.close();
                return;
            }
        };

        tracing::debug!(session = self.id.get(), "processing keep-alive");
        let sequence_nums: Vec<SequenceNum> = self.session_proposals.keys().copied().collect();
        for sequence_num in sequence_nums {
            if input.last_input_sequence_num < sequence_num {
                continue;
            }
            if !filter.contains(&sequence_num.to_be_bytes()) {
                self.finish_proposal(sequence_num, Phase::Canceled, index, scheduler);
                self.session_proposals.remove(&sequence_num);
            } else if let Some(&acked) = input.last_output_sequence_nums.get(&sequence_num) {
                self.ack_proposal(sequence_num, acked);
            }
        }

        self.last_updated_ms = scheduler.now_ms();
        self.schedule_expire(scheduler);
        parent.output(KeepAliveOutput {});
        parent.close();
    }

    /// Assign the next output sequence number, cache the output, and
    /// forward it to the currently bound parent. Outputs emitted after the
    /// proposal completed are dropped.
    pub(crate) fn push_output(&mut self, sequence_num: SequenceNum, body: ProposalOutputBody) {
        let Some(proposal) = self.session_proposals.get_mut(&sequence_num) else {
            return;
        };
        if proposal.phase == Phase::Complete {
            tracing::debug!(
                session = self.id.get(),
                proposal = proposal.id.get(),
                "dropping output emitted after close"
            );
            return;
        }
        proposal.last_output_seq = proposal.last_output_seq.next();
        let output = SessionProposalOutput {
            sequence_num: proposal.last_output_seq,
            body,
        };
        tracing::debug!(
            session = self.id.get(),
            proposal = proposal.id.get(),
            output_sequence_num = output.sequence_num.get(),
            "cached proposal output"
        );
        proposal.outputs.push_back(output.clone());
        if let Some(parent) = proposal.parent.as_mut() {
            parent.output(output);
        }
    }

    /// Transition a Running proposal to a terminal phase exactly once:
    /// conclude the bound parent, drop the deadline timer, fire phase
    /// watchers, and remove the proposal from both primitive indexes.
    pub(crate) fn finish_proposal(
        &mut self,
        sequence_num: SequenceNum,
        phase: Phase,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
    ) {
        let Some(proposal) = self.session_proposals.get_mut(&sequence_num) else {
            return;
        };
        if proposal.phase != Phase::Running {
            return;
        }
        proposal.phase = phase;
        if let Some(parent) = proposal.parent.as_mut() {
            match phase {
                Phase::Complete => parent.close(),
                Phase::Canceled => parent.cancel(),
                Phase::Running | Phase::Pending => {}
            }
        }
        if let Some(timer) = proposal.deadline_timer.take() {
            scheduler.cancel(timer);
        }
        for watcher in proposal.watchers.values_mut() {
            watcher(phase);
        }
        let id = proposal.id;
        self.primitive_proposals.remove(&id);
        index.remove(id);
    }

    /// Drop cached outputs up to and including `acked`.
    fn ack_proposal(&mut self, sequence_num: SequenceNum, acked: SequenceNum) {
        let Some(proposal) = self.session_proposals.get_mut(&sequence_num) else {
            return;
        };
        while proposal
            .outputs
            .front()
            .is_some_and(|output| output.sequence_num <= acked)
        {
            proposal.outputs.pop_front();
        }
        tracing::debug!(
            session = self.id.get(),
            proposal = proposal.id.get(),
            acked = acked.get(),
            "acked proposal outputs"
        );
    }

    pub(crate) fn watch_proposal(
        &mut self,
        sequence_num: SequenceNum,
        watcher: Box<dyn FnMut(Phase)>,
    ) -> Option<WatcherId> {
        let proposal = self.session_proposals.get_mut(&sequence_num)?;
        let id = WatcherId::next();
        proposal.watchers.insert(id, watcher);
        Some(id)
    }

    pub(crate) fn unwatch_proposal(&mut self, sequence_num: SequenceNum, watcher: WatcherId) {
        if let Some(proposal) = self.session_proposals.get_mut(&sequence_num) {
            proposal.watchers.remove(&watcher);
        }
    }

    /// Close the session: cancel timers, purge owned proposal ids from the
    /// global index, and notify watchers exactly once. The caller removes
    /// the session from the registry; dropping it destroys the proposals.
    pub(crate) fn close(
        &mut self,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
    ) {
        if let Some(timer) = self.expire_timer.take() {
            scheduler.cancel(timer);
        }
        for proposal in self.session_proposals.values_mut() {
            if let Some(timer) = proposal.deadline_timer.take() {
                scheduler.cancel(timer);
            }
        }
        for id in self.primitive_proposals.keys() {
            index.remove(*id);
        }
        self.state = SessionState::Closed;
        for watcher in self.watchers.values_mut() {
            watcher(SessionState::Closed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        writer: &mut SnapshotWriter<'_>,
    ) -> Result<(), SnapshotEncodeError> {
        tracing::debug!(session = self.id.get(), "persisting session to snapshot");
        writer.write_message(&SessionSnapshot {
            session_id: self.id,
            state: self.state,
            timeout: self.timeout,
            last_updated_ms: self.last_updated_ms,
        })?;
        writer.write_varint(self.session_proposals.len() as u64)?;
        for proposal in self.session_proposals.values() {
            writer.write_message(&proposal.to_snapshot())?;
        }
        Ok(())
    }

    pub(crate) fn recover(
        reader: &mut SnapshotReader<'_>,
        index: &mut ProposalIndex,
        scheduler: &mut Scheduler<TimerTask>,
    ) -> Result<Self, SnapshotDecodeError> {
        let snapshot: SessionSnapshot = reader.read_message()?;
        let mut session = Session {
            id: snapshot.session_id,
            state: snapshot.state,
            timeout: snapshot.timeout,
            last_updated_ms: snapshot.last_updated_ms,
            session_proposals: BTreeMap::new(),
            primitive_proposals: BTreeMap::new(),
            watchers: BTreeMap::new(),
            expire_timer: None,
        };
        tracing::debug!(
            session = session.id.get(),
            "recovering session from snapshot"
        );

        let count = reader.read_varint()?;
        if count > reader.limits().max_snapshot_entries as u64 {
            return Err(SnapshotDecodeError::DecodeLimit("max_snapshot_entries"));
        }
        for _ in 0..count {
            let proposal_snapshot: SessionProposalSnapshot = reader.read_message()?;
            let sequence_num = proposal_snapshot.input.sequence_num;
            let mut proposal = SessionProposal::from_snapshot(proposal_snapshot);
            if proposal.phase == Phase::Running {
                if let Some(deadline_ms) = proposal.input.deadline_ms {
                    proposal.deadline_timer = Some(scheduler.schedule(
                        deadline_ms,
                        TimerTask::CancelProposal {
                            session_id: session.id,
                            sequence_num,
                        },
                    ));
                }
                if matches!(proposal.input.input, ProposalInputKind::Proposal(_)) {
                    session.primitive_proposals.insert(proposal.id, sequence_num);
                    index.insert(proposal.id, session.id, sequence_num);
                }
            }
            session.session_proposals.insert(sequence_num, proposal);
        }

        session.schedule_expire(scheduler);
        Ok(session)
    }
}

/// One client command and its replay cache.
pub(crate) struct SessionProposal {
    pub(crate) id: ProposalId,
    pub(crate) input: SessionProposalInput,
    pub(crate) phase: Phase,
    /// Applier handle for the current invocation; rebound on every retry,
    /// absent between invocations.
    pub(crate) parent: Option<SessionProposalHandle>,
    pub(crate) outputs: VecDeque<SessionProposalOutput>,
    pub(crate) last_output_seq: SequenceNum,
    pub(crate) deadline_timer: Option<TimerHandle>,
    pub(crate) watchers: BTreeMap<WatcherId, Box<dyn FnMut(Phase)>>,
}

impl SessionProposal {
    pub(crate) fn new(id: ProposalId, input: SessionProposalInput) -> Self {
        Self {
            id,
            input,
            phase: Phase::Running,
            parent: None,
            outputs: VecDeque::new(),
            last_output_seq: SequenceNum::ZERO,
            deadline_timer: None,
            watchers: BTreeMap::new(),
        }
    }

    fn to_snapshot(&self) -> SessionProposalSnapshot {
        SessionProposalSnapshot {
            index: self.id,
            phase: self.phase,
            input: self.input.clone(),
            pending_outputs: self.outputs.iter().cloned().collect(),
            last_output_sequence_num: self.last_output_seq,
        }
    }

    fn from_snapshot(snapshot: SessionProposalSnapshot) -> Self {
        Self {
            id: snapshot.index,
            input: snapshot.input,
            phase: snapshot.phase,
            parent: None,
            outputs: snapshot.pending_outputs.into(),
            last_output_seq: snapshot.last_output_sequence_num,
            deadline_timer: None,
            watchers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use bytes::Bytes;

    use super::*;
    use crate::session::proto::{PrimitiveProposalInput, PrimitiveProposalOutput};
    use crate::statemachine::PrimitiveId;

    fn proposal_input(session: SessionId, sequence_num: u64) -> SessionProposalInput {
        SessionProposalInput {
            session_id: session,
            sequence_num: SequenceNum::new(sequence_num),
            deadline_ms: None,
            input: ProposalInputKind::Proposal(PrimitiveProposalInput {
                primitive_id: PrimitiveId::new(1),
                payload: Bytes::from_static(b"foo"),
            }),
        }
    }

    fn session_with_proposal() -> (Session, SequenceNum) {
        let mut session = Session::new(SessionId::new(1), Duration::from_secs(60), 0);
        let sequence_num = SequenceNum::new(1);
        session.session_proposals.insert(
            sequence_num,
            SessionProposal::new(ProposalId::new(2), proposal_input(session.id, 1)),
        );
        (session, sequence_num)
    }

    fn payload_output(payload: &'static [u8]) -> ProposalOutputBody {
        ProposalOutputBody::Proposal(PrimitiveProposalOutput {
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn outputs_are_numbered_gaplessly_from_one() {
        let (mut session, seq) = session_with_proposal();
        session.push_output(seq, payload_output(b"a"));
        session.push_output(seq, payload_output(b"b"));

        let proposal = &session.session_proposals[&seq];
        let nums: Vec<u64> = proposal
            .outputs
            .iter()
            .map(|o| o.sequence_num.get())
            .collect();
        assert_eq!(nums, vec![1, 2]);
        assert_eq!(proposal.last_output_seq.get(), 2);
    }

    #[test]
    fn ack_prunes_a_prefix_only() {
        let (mut session, seq) = session_with_proposal();
        for payload in [b"a" as &[u8], b"b", b"c"] {
            session.push_output(
                seq,
                ProposalOutputBody::Proposal(PrimitiveProposalOutput {
                    payload: Bytes::copy_from_slice(payload),
                }),
            );
        }
        session.ack_proposal(seq, SequenceNum::new(2));

        let proposal = &session.session_proposals[&seq];
        let nums: Vec<u64> = proposal
            .outputs
            .iter()
            .map(|o| o.sequence_num.get())
            .collect();
        assert_eq!(nums, vec![3]);
        // Numbering continues after the ack, no reuse.
        drop(proposal);
        session.push_output(seq, payload_output(b"d"));
        assert_eq!(
            session.session_proposals[&seq]
                .outputs
                .back()
                .unwrap()
                .sequence_num
                .get(),
            4
        );
    }

    #[test]
    fn output_after_complete_is_dropped() {
        let (mut session, seq) = session_with_proposal();
        let mut index = ProposalIndex::new();
        let mut scheduler = Scheduler::new();
        session.push_output(seq, payload_output(b"a"));
        session.finish_proposal(seq, Phase::Complete, &mut index, &mut scheduler);
        session.push_output(seq, payload_output(b"late"));

        let proposal = &session.session_proposals[&seq];
        assert_eq!(proposal.outputs.len(), 1);
        assert_eq!(proposal.last_output_seq.get(), 1);
    }

    #[test]
    fn output_after_cancel_is_still_cached() {
        let (mut session, seq) = session_with_proposal();
        let mut index = ProposalIndex::new();
        let mut scheduler = Scheduler::new();
        session.finish_proposal(seq, Phase::Canceled, &mut index, &mut scheduler);
        session.push_output(seq, payload_output(b"a"));

        assert_eq!(session.session_proposals[&seq].outputs.len(), 1);
    }

    #[test]
    fn finish_is_idempotent_and_notifies_once() {
        let (mut session, seq) = session_with_proposal();
        let mut index = ProposalIndex::new();
        let mut scheduler = Scheduler::new();
        index.insert(ProposalId::new(2), session.id, seq);
        session
            .primitive_proposals
            .insert(ProposalId::new(2), seq);

        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();
        session
            .watch_proposal(
                seq,
                Box::new(move |phase| {
                    assert_eq!(phase, Phase::Complete);
                    observed.set(observed.get() + 1);
                }),
            )
            .unwrap();

        session.finish_proposal(seq, Phase::Complete, &mut index, &mut scheduler);
        session.finish_proposal(seq, Phase::Complete, &mut index, &mut scheduler);
        session.finish_proposal(seq, Phase::Canceled, &mut index, &mut scheduler);

        assert_eq!(fired.get(), 1);
        assert_eq!(session.session_proposals[&seq].phase, Phase::Complete);
        assert!(session.primitive_proposals.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn close_notifies_session_watchers_once_and_purges_index() {
        let (mut session, seq) = session_with_proposal();
        let mut index = ProposalIndex::new();
        let mut scheduler = Scheduler::new();
        index.insert(ProposalId::new(2), session.id, seq);
        session
            .primitive_proposals
            .insert(ProposalId::new(2), seq);

        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();
        session.watch(move |state| {
            assert_eq!(state, SessionState::Closed);
            observed.set(observed.get() + 1);
        });

        session.close(&mut index, &mut scheduler);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fired.get(), 1);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn unwatch_removes_session_watcher() {
        let mut session = Session::new(SessionId::new(1), Duration::from_secs(60), 0);
        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();
        let watcher = session.watch(move |_| observed.set(observed.get() + 1));
        session.unwatch(watcher);

        let mut index = ProposalIndex::new();
        let mut scheduler = Scheduler::new();
        session.close(&mut index, &mut scheduler);
        assert_eq!(fired.get(), 0);
    }
}
