//! Primitive-facing proposal and query handles.
//!
//! Handles are short-lived reborrows of the session arena: they carry the
//! owning session, the global proposal index, and the scheduler for the
//! duration of one adapter call. Primitives address sibling stream
//! proposals by id through [`PrimitiveProposals::get`]; nothing hands out
//! long-lived references.

use crate::failure::Failure;
use crate::statemachine::scheduler::Scheduler;
use crate::statemachine::{
    Phase, ProposalId, SequenceNum, SessionId, SessionState, WatcherId,
};

use super::proto::{
    ClosePrimitiveInput, ClosePrimitiveOutput, CreatePrimitiveInput, CreatePrimitiveOutput,
    PrimitiveProposalInput, PrimitiveProposalOutput, PrimitiveQueryInput, PrimitiveQueryOutput,
    ProposalInputKind, ProposalOutputBody, QueryOutputBody, SessionQueryOutput,
};
use super::session::Session;
use super::{ProposalIndex, SessionQueryHandle, TimerTask};

struct ProposalRef<'a> {
    session: &'a mut Session,
    index: &'a mut ProposalIndex,
    scheduler: &'a mut Scheduler<TimerTask>,
    sequence_num: SequenceNum,
    id: ProposalId,
}

impl<'a> ProposalRef<'a> {
    fn new(
        session: &'a mut Session,
        index: &'a mut ProposalIndex,
        scheduler: &'a mut Scheduler<TimerTask>,
        sequence_num: SequenceNum,
    ) -> Self {
        let id = session
            .session_proposals
            .get(&sequence_num)
            .map(|proposal| proposal.id)
            .unwrap_or(ProposalId::new(0));
        Self {
            session,
            index,
            scheduler,
            sequence_num,
            id,
        }
    }

    fn input(&self) -> &ProposalInputKind {
        &self.session.session_proposals[&self.sequence_num].input.input
    }

    fn emit(&mut self, body: ProposalOutputBody) {
        self.session.push_output(self.sequence_num, body);
    }

    fn close(&mut self) {
        self.session
            .finish_proposal(self.sequence_num, Phase::Complete, self.index, self.scheduler);
    }

    fn cancel(&mut self) {
        self.session
            .finish_proposal(self.sequence_num, Phase::Canceled, self.index, self.scheduler);
    }

    fn watch(&mut self, watcher: Box<dyn FnMut(Phase)>) -> Option<WatcherId> {
        self.session.watch_proposal(self.sequence_num, watcher)
    }
}

macro_rules! proposal_handle_common {
    () => {
        pub fn id(&self) -> ProposalId {
            self.inner.id
        }

        pub fn session_id(&self) -> SessionId {
            self.inner.session.id()
        }

        pub fn session_state(&self) -> SessionState {
            self.inner.session.state()
        }

        pub fn error(&mut self, failure: Failure) {
            self.inner.emit(ProposalOutputBody::Failure(failure));
        }

        pub fn close(&mut self) {
            self.inner.close();
        }

        pub fn cancel(&mut self) {
            self.inner.cancel();
        }

        /// Observe this proposal's terminal phase. The watcher fires at
        /// most once.
        pub fn watch(&mut self, watcher: impl FnMut(Phase) + 'static) -> Option<WatcherId> {
            self.inner.watch(Box::new(watcher))
        }

        pub fn unwatch(&mut self, watcher: WatcherId) {
            self.inner
                .session
                .unwatch_proposal(self.inner.sequence_num, watcher);
        }

        /// Observe the owning session's close. Fires at most once.
        pub fn watch_session(
            &mut self,
            watcher: impl FnMut(SessionState) + 'static,
        ) -> WatcherId {
            self.inner.session.watch(watcher)
        }
    };
}

/// Handle through which a primitive serves a `CreatePrimitive` proposal.
pub struct CreatePrimitiveProposal<'a> {
    inner: ProposalRef<'a>,
}

impl<'a> CreatePrimitiveProposal<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        index: &'a mut ProposalIndex,
        scheduler: &'a mut Scheduler<TimerTask>,
        sequence_num: SequenceNum,
    ) -> Self {
        Self {
            inner: ProposalRef::new(session, index, scheduler, sequence_num),
        }
    }

    proposal_handle_common!();

    pub fn input(&self) -> &CreatePrimitiveInput {
        match self.inner.input() {
            ProposalInputKind::CreatePrimitive(input) => input,
            // Constructed only for create-primitive proposals.
            _ => unreachable!("create-primitive handle bound to another input kind"),
        }
    }

    pub fn output(&mut self, output: CreatePrimitiveOutput) {
        self.inner.emit(ProposalOutputBody::CreatePrimitive(output));
    }
}

/// Handle through which a primitive serves a `ClosePrimitive` proposal.
pub struct ClosePrimitiveProposal<'a> {
    inner: ProposalRef<'a>,
}

impl<'a> ClosePrimitiveProposal<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        index: &'a mut ProposalIndex,
        scheduler: &'a mut Scheduler<TimerTask>,
        sequence_num: SequenceNum,
    ) -> Self {
        Self {
            inner: ProposalRef::new(session, index, scheduler, sequence_num),
        }
    }

    proposal_handle_common!();

    pub fn input(&self) -> &ClosePrimitiveInput {
        match self.inner.input() {
            ProposalInputKind::ClosePrimitive(input) => input,
            _ => unreachable!("close-primitive handle bound to another input kind"),
        }
    }

    pub fn output(&mut self, output: ClosePrimitiveOutput) {
        self.inner.emit(ProposalOutputBody::ClosePrimitive(output));
    }
}

/// Handle through which a primitive serves an ordinary proposal.
///
/// A proposal left open when the adapter returns is a stream: later
/// proposals reach it through [`PrimitiveProposal::proposals`] and push
/// further outputs into it.
pub struct PrimitiveProposal<'a> {
    inner: ProposalRef<'a>,
}

impl<'a> PrimitiveProposal<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        index: &'a mut ProposalIndex,
        scheduler: &'a mut Scheduler<TimerTask>,
        sequence_num: SequenceNum,
    ) -> Self {
        Self {
            inner: ProposalRef::new(session, index, scheduler, sequence_num),
        }
    }

    proposal_handle_common!();

    pub fn input(&self) -> &PrimitiveProposalInput {
        match self.inner.input() {
            ProposalInputKind::Proposal(input) => input,
            _ => unreachable!("primitive proposal handle bound to another input kind"),
        }
    }

    pub fn output(&mut self, output: PrimitiveProposalOutput) {
        self.inner.emit(ProposalOutputBody::Proposal(output));
    }

    /// View of the session's Running primitive proposals, for streaming
    /// into siblings.
    pub fn proposals(&mut self) -> PrimitiveProposals<'_> {
        PrimitiveProposals {
            session: &mut *self.inner.session,
            index: &mut *self.inner.index,
            scheduler: &mut *self.inner.scheduler,
        }
    }
}

/// Session-scoped lookup of Running primitive proposals by Raft index.
pub struct PrimitiveProposals<'a> {
    session: &'a mut Session,
    index: &'a mut ProposalIndex,
    scheduler: &'a mut Scheduler<TimerTask>,
}

impl PrimitiveProposals<'_> {
    pub fn get(&mut self, id: ProposalId) -> Option<PrimitiveProposal<'_>> {
        let sequence_num = *self.session.primitive_proposals.get(&id)?;
        Some(PrimitiveProposal::new(
            &mut *self.session,
            &mut *self.index,
            &mut *self.scheduler,
            sequence_num,
        ))
    }

    pub fn ids(&self) -> Vec<ProposalId> {
        self.session.primitive_proposals.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.session.primitive_proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.primitive_proposals.is_empty()
    }
}

/// Handle through which a primitive serves a query.
///
/// Queries run to completion inside the applying entry: the adapter emits
/// outputs and closes before returning. Nothing is cached or snapshotted.
pub struct PrimitiveQuery<'a> {
    session: &'a Session,
    parent: &'a mut SessionQueryHandle,
}

impl<'a> PrimitiveQuery<'a> {
    pub(crate) fn new(session: &'a Session, parent: &'a mut SessionQueryHandle) -> Self {
        Self { session, parent }
    }

    pub fn id(&self) -> crate::statemachine::QueryId {
        self.parent.id()
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn input(&self) -> &PrimitiveQueryInput {
        &self.parent.input().query
    }

    pub fn output(&mut self, output: PrimitiveQueryOutput) {
        self.parent.output(SessionQueryOutput {
            body: QueryOutputBody::Query(output),
        });
    }

    pub fn error(&mut self, failure: Failure) {
        self.parent.output(SessionQueryOutput {
            body: QueryOutputBody::Failure(failure),
        });
    }

    pub fn close(&mut self) {
        self.parent.close();
    }

    pub fn cancel(&mut self) {
        self.parent.cancel();
    }
}
