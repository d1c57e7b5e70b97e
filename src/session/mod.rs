//! Replicated session management.
//!
//! [`SessionManager`] is the entry point the Raft applier drives: it turns
//! ordered log entries into idempotent, replayable calls into primitive
//! state machines, and snapshots/recovers the whole session tree.

pub mod filter;
pub mod primitive;
pub mod proposal;
pub mod proto;
#[allow(clippy::module_inception)]
pub mod session;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::failure::{Failure, SessionError};
use crate::limits::Limits;
use crate::snapshot::{SnapshotDecodeError, SnapshotEncodeError, SnapshotReader, SnapshotWriter};
use crate::statemachine::scheduler::Scheduler;
use crate::statemachine::{
    duration_to_ms, Phase, Proposal, Query, SequenceNum, SessionId, SessionState, WatcherId,
};

use primitive::PrimitiveManager;
use proposal::PrimitiveQuery;
use proto::{
    CloseSessionInput, CloseSessionOutput, KeepAliveInput, KeepAliveOutput, OpenSessionInput,
    OpenSessionOutput, SessionProposalInput, SessionProposalOutput, SessionQueryInput,
    SessionQueryOutput,
};
use session::Session;

pub use crate::statemachine::ProposalId;

/// Applier-supplied handle for a session proposal entry. Retained by the
/// session layer while the proposal is open, so streams can keep pushing
/// outputs into it.
pub type SessionProposalHandle =
    Box<dyn Proposal<Input = SessionProposalInput, Output = SessionProposalOutput>>;

/// Applier-supplied handle for a session query entry.
pub type SessionQueryHandle = Box<dyn Query<Input = SessionQueryInput, Output = SessionQueryOutput>>;

/// Work scheduled on the logical clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerTask {
    ExpireSession(SessionId),
    CancelProposal {
        session_id: SessionId,
        sequence_num: SequenceNum,
    },
}

/// Registry of live sessions, keyed and iterated by session id.
#[derive(Default)]
pub struct Sessions {
    sessions: BTreeMap<SessionId, Session>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn add(&mut self, session: Session) -> bool {
        let id = session.id();
        if self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(id, session);
        true
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }
}

/// Global index of Running primitive proposals: Raft index to owner.
/// Holds ids only; the sessions own the proposals.
#[derive(Default)]
pub struct ProposalIndex {
    proposals: BTreeMap<ProposalId, (SessionId, SequenceNum)>,
}

impl ProposalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ProposalId) -> Option<(SessionId, SequenceNum)> {
        self.proposals.get(&id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = ProposalId> + '_ {
        self.proposals.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub(crate) fn insert(&mut self, id: ProposalId, session_id: SessionId, sequence_num: SequenceNum) {
        self.proposals.insert(id, (session_id, sequence_num));
    }

    pub(crate) fn remove(&mut self, id: ProposalId) {
        self.proposals.remove(&id);
    }
}

/// The session manager state machine.
///
/// Single-threaded with the Raft applier: every method runs to completion
/// against one log entry, and all observable effects are deterministic
/// functions of entry order.
pub struct SessionManager<P> {
    sessions: Sessions,
    proposals: ProposalIndex,
    scheduler: Scheduler<TimerTask>,
    primitives: P,
    limits: Limits,
    span: tracing::Span,
}

impl<P: PrimitiveManager> SessionManager<P> {
    pub fn new(primitives: P, limits: Limits) -> Self {
        Self {
            sessions: Sessions::new(),
            proposals: ProposalIndex::new(),
            scheduler: Scheduler::new(),
            primitives,
            limits,
            span: tracing::info_span!("session_manager"),
        }
    }

    /// Current logical time, as last fed through [`SessionManager::tick`].
    pub fn time_ms(&self) -> u64 {
        self.scheduler.now_ms()
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn proposal_index(&self) -> &ProposalIndex {
        &self.proposals
    }

    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    pub fn primitives_mut(&mut self) -> &mut P {
        &mut self.primitives
    }

    /// Advance the logical clock to the applying entry's timestamp and run
    /// every timer due at or before it, in deterministic order. The applier
    /// calls this before each entry's operation.
    pub fn tick(&mut self, now_ms: u64) {
        let _guard = self.span.clone().entered();
        for task in self.scheduler.advance(now_ms) {
            match task {
                TimerTask::ExpireSession(session_id) => self.expire_session(session_id),
                TimerTask::CancelProposal {
                    session_id,
                    sequence_num,
                } => {
                    if let Some(session) = self.sessions.get_mut(session_id) {
                        tracing::debug!(
                            session = session_id.get(),
                            sequence_num = sequence_num.get(),
                            "proposal deadline elapsed"
                        );
                        session.finish_proposal(
                            sequence_num,
                            Phase::Canceled,
                            &mut self.proposals,
                            &mut self.scheduler,
                        );
                    }
                }
            }
        }
    }

    pub fn open_session(
        &mut self,
        proposal: &mut dyn Proposal<Input = OpenSessionInput, Output = OpenSessionOutput>,
    ) {
        let _guard = self.span.enter();
        let id = SessionId::from(proposal.id());
        let timeout = proposal.input().timeout;
        let mut session = Session::new(id, timeout, self.scheduler.now_ms());
        session.schedule_expire(&mut self.scheduler);
        if !self.sessions.add(session) {
            tracing::warn!(session = id.get(), "session id already registered");
        }
        tracing::info!(
            session = id.get(),
            timeout_ms = duration_to_ms(timeout),
            "opened session"
        );
        proposal.output(OpenSessionOutput { session_id: id });
        proposal.close();
    }

    pub fn keep_alive(
        &mut self,
        proposal: &mut dyn Proposal<Input = KeepAliveInput, Output = KeepAliveOutput>,
    ) {
        let _guard = self.span.enter();
        let session_id = proposal.input().session_id;
        let Some(session) = self.sessions.get_mut(session_id) else {
            proposal.error(Failure::from(SessionError::UnknownSession(session_id)));
            proposal.close();
            return;
        };
        session.keep_alive(proposal, &mut self.proposals, &mut self.scheduler, &self.limits);
    }

    pub fn close_session(
        &mut self,
        proposal: &mut dyn Proposal<Input = CloseSessionInput, Output = CloseSessionOutput>,
    ) {
        let _guard = self.span.enter();
        let session_id = proposal.input().session_id;
        let Some(mut session) = self.sessions.remove(session_id) else {
            proposal.error(Failure::from(SessionError::UnknownSession(session_id)));
            proposal.close();
            return;
        };
        session.close(&mut self.proposals, &mut self.scheduler);
        tracing::info!(session = session_id.get(), "closed session");
        proposal.output(CloseSessionOutput {});
        proposal.close();
    }

    pub fn propose(&mut self, mut proposal: SessionProposalHandle) {
        let _guard = self.span.enter();
        let session_id = proposal.input().session_id;
        let Some(session) = self.sessions.get_mut(session_id) else {
            proposal.error(Failure::from(SessionError::UnknownSession(session_id)));
            proposal.close();
            return;
        };
        session.propose(
            proposal,
            &mut self.proposals,
            &mut self.scheduler,
            &mut self.primitives,
        );
    }

    pub fn query(&mut self, mut query: SessionQueryHandle) {
        let _guard = self.span.enter();
        let session_id = query.input().session_id;
        let Some(session) = self.sessions.get(session_id) else {
            query.error(Failure::from(SessionError::UnknownSession(session_id)));
            query.close();
            return;
        };
        if let Some(deadline_ms) = query.input().deadline_ms {
            let now_ms = self.scheduler.now_ms();
            if deadline_ms <= now_ms {
                query.error(Failure::from(SessionError::DeadlineElapsed {
                    deadline_ms,
                    now_ms,
                }));
                query.cancel();
                return;
            }
        }
        let trapped = catch_unwind(AssertUnwindSafe(|| {
            self.primitives.query(PrimitiveQuery::new(session, &mut query));
        }));
        if trapped.is_err() {
            tracing::error!(
                session = session_id.get(),
                "primitive state machine panicked; trapped as INTERNAL failure"
            );
            query.error(Failure::internal("primitive state machine panicked"));
            query.close();
        }
    }

    /// Register a watcher on a live session; fires exactly once when the
    /// session closes or expires.
    pub fn watch_session(
        &mut self,
        session_id: SessionId,
        watcher: impl FnMut(SessionState) + 'static,
    ) -> Option<WatcherId> {
        let session = self.sessions.get_mut(session_id)?;
        Some(session.watch(watcher))
    }

    pub fn unwatch_session(&mut self, session_id: SessionId, watcher: WatcherId) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.unwatch(watcher);
        }
    }

    /// Serialize the full manager state: session count, per-session blocks,
    /// then the primitive implementation's own data.
    pub fn snapshot(&mut self, writer: &mut SnapshotWriter<'_>) -> Result<(), SnapshotEncodeError> {
        let _guard = self.span.enter();
        tracing::debug!(sessions = self.sessions.len(), "persisting snapshot");
        writer.write_varint(self.sessions.len() as u64)?;
        for session in self.sessions.iter() {
            session.snapshot(writer)?;
        }
        self.primitives.snapshot(writer)
    }

    /// Exact dual of [`SessionManager::snapshot`]. Rebuilds sessions,
    /// reattaches Running primitive proposals to the index, and reschedules
    /// expire and deadline timers; the primitive recovers independently.
    pub fn recover(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotDecodeError> {
        let _guard = self.span.enter();
        self.sessions = Sessions::new();
        self.proposals = ProposalIndex::new();
        self.scheduler.clear();

        let count = reader.read_varint()?;
        if count > self.limits.max_snapshot_entries as u64 {
            return Err(SnapshotDecodeError::DecodeLimit("max_snapshot_entries"));
        }
        for _ in 0..count {
            let session = Session::recover(reader, &mut self.proposals, &mut self.scheduler)?;
            if !self.sessions.add(session) {
                return Err(SnapshotDecodeError::InvalidField {
                    field: "session_id",
                    reason: "duplicate session in snapshot".into(),
                });
            }
        }
        tracing::debug!(sessions = self.sessions.len(), "recovered snapshot");
        self.primitives.recover(reader)
    }

    fn expire_session(&mut self, session_id: SessionId) {
        let now_ms = self.scheduler.now_ms();
        let expired = self
            .sessions
            .get(session_id)
            .is_some_and(|session| {
                now_ms
                    >= session
                        .last_updated_ms()
                        .saturating_add(duration_to_ms(session.timeout()))
            });
        if !expired {
            return;
        }
        let Some(mut session) = self.sessions.remove(session_id) else {
            return;
        };
        tracing::warn!(
            session = session_id.get(),
            idle_ms = now_ms.saturating_sub(session.last_updated_ms()),
            "session expired"
        );
        session.close(&mut self.proposals, &mut self.scheduler);
    }
}
