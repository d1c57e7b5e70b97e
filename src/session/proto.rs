//! Session operation records and their snapshot CBOR schemas.
//!
//! Inputs arrive from the applier with each log entry; outputs flow back
//! through proposal handles. The snapshot records (`SessionSnapshot`,
//! `SessionProposalSnapshot`) fix the replicated wire format: string-keyed
//! maps, definite lengths, unknown keys skipped, tagged unions encoded as
//! a `kind` discriminant followed by a `body` map. `kind` always precedes
//! `body`.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::failure::{Failure, FailureStatus};
use crate::limits::Limits;
use crate::snapshot::{
    decode_array_len, decode_bytes, decode_map_len, decode_text, decode_u32, skip_value, Message,
    SnapshotDecodeError, SnapshotEncodeError,
};
use crate::statemachine::{
    duration_from_ms, duration_to_ms, Phase, PrimitiveId, ProposalId, SequenceNum, SessionId,
    SessionState,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenSessionInput {
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenSessionOutput {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepAliveInput {
    pub session_id: SessionId,
    /// Serialized [`InputFilter`](super::filter::InputFilter) document.
    pub input_filter: Bytes,
    pub last_input_sequence_num: SequenceNum,
    pub last_output_sequence_nums: BTreeMap<SequenceNum, SequenceNum>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeepAliveOutput {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseSessionInput {
    pub session_id: SessionId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseSessionOutput {}

/// Identity of a primitive instance: which service implements it and where
/// it lives in the store's namespace tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveSpec {
    pub service: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatePrimitiveInput {
    pub spec: PrimitiveSpec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatePrimitiveOutput {
    pub primitive_id: PrimitiveId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosePrimitiveInput {
    pub primitive_id: PrimitiveId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClosePrimitiveOutput {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveProposalInput {
    pub primitive_id: PrimitiveId,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveProposalOutput {
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveQueryInput {
    pub primitive_id: PrimitiveId,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimitiveQueryOutput {
    pub payload: Bytes,
}

/// Tagged union of the operations a session proposal can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposalInputKind {
    CreatePrimitive(CreatePrimitiveInput),
    ClosePrimitive(ClosePrimitiveInput),
    Proposal(PrimitiveProposalInput),
}

impl ProposalInputKind {
    fn kind_str(&self) -> &'static str {
        match self {
            ProposalInputKind::CreatePrimitive(_) => "create_primitive",
            ProposalInputKind::ClosePrimitive(_) => "close_primitive",
            ProposalInputKind::Proposal(_) => "proposal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProposalInput {
    pub session_id: SessionId,
    pub sequence_num: SequenceNum,
    /// Absolute logical deadline; elapsing it cancels the proposal.
    pub deadline_ms: Option<u64>,
    pub input: ProposalInputKind,
}

/// One replayable unit of proposal output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposalOutputBody {
    CreatePrimitive(CreatePrimitiveOutput),
    ClosePrimitive(ClosePrimitiveOutput),
    Proposal(PrimitiveProposalOutput),
    Failure(Failure),
}

impl ProposalOutputBody {
    fn kind_str(&self) -> &'static str {
        match self {
            ProposalOutputBody::CreatePrimitive(_) => "create_primitive",
            ProposalOutputBody::ClosePrimitive(_) => "close_primitive",
            ProposalOutputBody::Proposal(_) => "proposal",
            ProposalOutputBody::Failure(_) => "failure",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProposalOutput {
    pub sequence_num: SequenceNum,
    pub body: ProposalOutputBody,
}

impl SessionProposalOutput {
    pub fn as_proposal(&self) -> Option<&PrimitiveProposalOutput> {
        match &self.body {
            ProposalOutputBody::Proposal(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_create_primitive(&self) -> Option<&CreatePrimitiveOutput> {
        match &self.body {
            ProposalOutputBody::CreatePrimitive(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_close_primitive(&self) -> Option<&ClosePrimitiveOutput> {
        match &self.body {
            ProposalOutputBody::ClosePrimitive(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match &self.body {
            ProposalOutputBody::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionQueryInput {
    pub session_id: SessionId,
    pub deadline_ms: Option<u64>,
    pub query: PrimitiveQueryInput,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutputBody {
    Query(PrimitiveQueryOutput),
    Failure(Failure),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionQueryOutput {
    pub body: QueryOutputBody,
}

impl SessionQueryOutput {
    pub fn as_query(&self) -> Option<&PrimitiveQueryOutput> {
        match &self.body {
            QueryOutputBody::Query(output) => Some(output),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match &self.body {
            QueryOutputBody::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Per-session snapshot header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub timeout: Duration,
    pub last_updated_ms: u64,
}

/// Per-proposal snapshot record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProposalSnapshot {
    pub index: ProposalId,
    pub phase: Phase,
    pub input: SessionProposalInput,
    pub pending_outputs: Vec<SessionProposalOutput>,
    pub last_output_sequence_num: SequenceNum,
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

impl Message for SessionSnapshot {
    fn encode(&self, enc: &mut Encoder<&mut Vec<u8>>) -> Result<(), SnapshotEncodeError> {
        enc.map(4)?;
        enc.str("session_id")?;
        enc.u64(self.session_id.get())?;
        enc.str("state")?;
        enc.u32(self.state.to_wire())?;
        enc.str("timeout_ms")?;
        enc.u64(duration_to_ms(self.timeout))?;
        enc.str("last_updated_ms")?;
        enc.u64(self.last_updated_ms)?;
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>, limits: &Limits) -> Result<Self, SnapshotDecodeError> {
        let map_len = decode_map_len(dec, limits)?;
        let mut session_id = None;
        let mut state = None;
        let mut timeout = None;
        let mut last_updated_ms = None;
        for _ in 0..map_len {
            match decode_text(dec, limits)? {
                "session_id" => session_id = Some(SessionId::new(dec.u64()?)),
                "state" => {
                    let raw = decode_u32(dec, "state")?;
                    state = Some(SessionState::from_wire(raw).ok_or(
                        SnapshotDecodeError::InvalidField {
                            field: "state",
                            reason: format!("unknown state {raw}"),
                        },
                    )?);
                }
                "timeout_ms" => timeout = Some(duration_from_ms(dec.u64()?)),
                "last_updated_ms" => last_updated_ms = Some(dec.u64()?),
                _ => skip_value(dec)?,
            }
        }
        Ok(SessionSnapshot {
            session_id: session_id.ok_or(SnapshotDecodeError::MissingField("session_id"))?,
            state: state.ok_or(SnapshotDecodeError::MissingField("state"))?,
            timeout: timeout.ok_or(SnapshotDecodeError::MissingField("timeout_ms"))?,
            last_updated_ms: last_updated_ms
                .ok_or(SnapshotDecodeError::MissingField("last_updated_ms"))?,
        })
    }
}

impl Message for SessionProposalSnapshot {
    fn encode(&self, enc: &mut Encoder<&mut Vec<u8>>) -> Result<(), SnapshotEncodeError> {
        enc.map(5)?;
        enc.str("index")?;
        enc.u64(self.index.get())?;
        enc.str("phase")?;
        enc.u32(self.phase.to_wire())?;
        enc.str("input")?;
        encode_proposal_input(enc, &self.input)?;
        enc.str("pending_outputs")?;
        enc.array(self.pending_outputs.len() as u64)?;
        for output in &self.pending_outputs {
            encode_proposal_output(enc, output)?;
        }
        enc.str("last_output_sequence_num")?;
        enc.u64(self.last_output_sequence_num.get())?;
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>, limits: &Limits) -> Result<Self, SnapshotDecodeError> {
        let map_len = decode_map_len(dec, limits)?;
        let mut index = None;
        let mut phase = None;
        let mut input = None;
        let mut pending_outputs = None;
        let mut last_output_sequence_num = None;
        for _ in 0..map_len {
            match decode_text(dec, limits)? {
                "index" => index = Some(ProposalId::new(dec.u64()?)),
                "phase" => {
                    let raw = decode_u32(dec, "phase")?;
                    phase = Some(Phase::from_wire(raw).ok_or(
                        SnapshotDecodeError::InvalidField {
                            field: "phase",
                            reason: format!("unknown phase {raw}"),
                        },
                    )?);
                }
                "input" => input = Some(decode_proposal_input(dec, limits)?),
                "pending_outputs" => {
                    let len = decode_array_len(dec, limits)?;
                    let mut outputs = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        outputs.push(decode_proposal_output(dec, limits)?);
                    }
                    pending_outputs = Some(outputs);
                }
                "last_output_sequence_num" => {
                    last_output_sequence_num = Some(SequenceNum::new(dec.u64()?));
                }
                _ => skip_value(dec)?,
            }
        }
        Ok(SessionProposalSnapshot {
            index: index.ok_or(SnapshotDecodeError::MissingField("index"))?,
            phase: phase.ok_or(SnapshotDecodeError::MissingField("phase"))?,
            input: input.ok_or(SnapshotDecodeError::MissingField("input"))?,
            pending_outputs: pending_outputs
                .ok_or(SnapshotDecodeError::MissingField("pending_outputs"))?,
            last_output_sequence_num: last_output_sequence_num
                .ok_or(SnapshotDecodeError::MissingField("last_output_sequence_num"))?,
        })
    }
}

fn encode_proposal_input(
    enc: &mut Enc<'_>,
    input: &SessionProposalInput,
) -> Result<(), SnapshotEncodeError> {
    let mut len: u64 = 4;
    if input.deadline_ms.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("session_id")?;
    enc.u64(input.session_id.get())?;
    enc.str("sequence_num")?;
    enc.u64(input.sequence_num.get())?;
    if let Some(deadline_ms) = input.deadline_ms {
        enc.str("deadline_ms")?;
        enc.u64(deadline_ms)?;
    }
    enc.str("kind")?;
    enc.str(input.input.kind_str())?;
    enc.str("body")?;
    match &input.input {
        ProposalInputKind::CreatePrimitive(body) => {
            enc.map(3)?;
            enc.str("service")?;
            enc.str(&body.spec.service)?;
            enc.str("namespace")?;
            enc.str(&body.spec.namespace)?;
            enc.str("name")?;
            enc.str(&body.spec.name)?;
        }
        ProposalInputKind::ClosePrimitive(body) => {
            enc.map(1)?;
            enc.str("primitive_id")?;
            enc.u64(body.primitive_id.get())?;
        }
        ProposalInputKind::Proposal(body) => {
            enc.map(2)?;
            enc.str("primitive_id")?;
            enc.u64(body.primitive_id.get())?;
            enc.str("payload")?;
            enc.bytes(&body.payload)?;
        }
    }
    Ok(())
}

fn decode_proposal_input(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<SessionProposalInput, SnapshotDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut session_id = None;
    let mut sequence_num = None;
    let mut deadline_ms = None;
    let mut kind: Option<String> = None;
    let mut input = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session_id" => session_id = Some(SessionId::new(dec.u64()?)),
            "sequence_num" => sequence_num = Some(SequenceNum::new(dec.u64()?)),
            "deadline_ms" => deadline_ms = Some(dec.u64()?),
            "kind" => kind = Some(decode_text(dec, limits)?.to_string()),
            "body" => {
                let kind = kind.as_deref().ok_or(SnapshotDecodeError::InvalidField {
                    field: "body",
                    reason: "body precedes kind".into(),
                })?;
                input = Some(decode_proposal_input_body(dec, limits, kind)?);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(SessionProposalInput {
        session_id: session_id.ok_or(SnapshotDecodeError::MissingField("session_id"))?,
        sequence_num: sequence_num.ok_or(SnapshotDecodeError::MissingField("sequence_num"))?,
        deadline_ms,
        input: input.ok_or(SnapshotDecodeError::MissingField("body"))?,
    })
}

fn decode_proposal_input_body(
    dec: &mut Decoder<'_>,
    limits: &Limits,
    kind: &str,
) -> Result<ProposalInputKind, SnapshotDecodeError> {
    match kind {
        "create_primitive" => {
            let map_len = decode_map_len(dec, limits)?;
            let mut service = None;
            let mut namespace = None;
            let mut name = None;
            for _ in 0..map_len {
                match decode_text(dec, limits)? {
                    "service" => service = Some(decode_text(dec, limits)?.to_string()),
                    "namespace" => namespace = Some(decode_text(dec, limits)?.to_string()),
                    "name" => name = Some(decode_text(dec, limits)?.to_string()),
                    _ => skip_value(dec)?,
                }
            }
            Ok(ProposalInputKind::CreatePrimitive(CreatePrimitiveInput {
                spec: PrimitiveSpec {
                    service: service.ok_or(SnapshotDecodeError::MissingField("service"))?,
                    namespace: namespace.ok_or(SnapshotDecodeError::MissingField("namespace"))?,
                    name: name.ok_or(SnapshotDecodeError::MissingField("name"))?,
                },
            }))
        }
        "close_primitive" => {
            let primitive_id = decode_primitive_id_body(dec, limits)?;
            Ok(ProposalInputKind::ClosePrimitive(ClosePrimitiveInput {
                primitive_id,
            }))
        }
        "proposal" => {
            let map_len = decode_map_len(dec, limits)?;
            let mut primitive_id = None;
            let mut payload = None;
            for _ in 0..map_len {
                match decode_text(dec, limits)? {
                    "primitive_id" => primitive_id = Some(PrimitiveId::new(dec.u64()?)),
                    "payload" => {
                        payload =
                            Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "payload")?));
                    }
                    _ => skip_value(dec)?,
                }
            }
            Ok(ProposalInputKind::Proposal(PrimitiveProposalInput {
                primitive_id: primitive_id
                    .ok_or(SnapshotDecodeError::MissingField("primitive_id"))?,
                payload: payload.ok_or(SnapshotDecodeError::MissingField("payload"))?,
            }))
        }
        other => Err(SnapshotDecodeError::InvalidField {
            field: "kind",
            reason: format!("unknown input kind {other}"),
        }),
    }
}

fn encode_proposal_output(
    enc: &mut Enc<'_>,
    output: &SessionProposalOutput,
) -> Result<(), SnapshotEncodeError> {
    enc.map(3)?;
    enc.str("sequence_num")?;
    enc.u64(output.sequence_num.get())?;
    enc.str("kind")?;
    enc.str(output.body.kind_str())?;
    enc.str("body")?;
    match &output.body {
        ProposalOutputBody::CreatePrimitive(body) => {
            enc.map(1)?;
            enc.str("primitive_id")?;
            enc.u64(body.primitive_id.get())?;
        }
        ProposalOutputBody::ClosePrimitive(_) => {
            enc.map(0)?;
        }
        ProposalOutputBody::Proposal(body) => {
            enc.map(1)?;
            enc.str("payload")?;
            enc.bytes(&body.payload)?;
        }
        ProposalOutputBody::Failure(failure) => {
            enc.map(2)?;
            enc.str("status")?;
            enc.u32(failure.status.to_wire())?;
            enc.str("message")?;
            enc.str(&failure.message)?;
        }
    }
    Ok(())
}

fn decode_proposal_output(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<SessionProposalOutput, SnapshotDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut sequence_num = None;
    let mut kind: Option<String> = None;
    let mut body = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "sequence_num" => sequence_num = Some(SequenceNum::new(dec.u64()?)),
            "kind" => kind = Some(decode_text(dec, limits)?.to_string()),
            "body" => {
                let kind = kind.as_deref().ok_or(SnapshotDecodeError::InvalidField {
                    field: "body",
                    reason: "body precedes kind".into(),
                })?;
                body = Some(decode_proposal_output_body(dec, limits, kind)?);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(SessionProposalOutput {
        sequence_num: sequence_num.ok_or(SnapshotDecodeError::MissingField("sequence_num"))?,
        body: body.ok_or(SnapshotDecodeError::MissingField("body"))?,
    })
}

fn decode_proposal_output_body(
    dec: &mut Decoder<'_>,
    limits: &Limits,
    kind: &str,
) -> Result<ProposalOutputBody, SnapshotDecodeError> {
    match kind {
        "create_primitive" => {
            let primitive_id = decode_primitive_id_body(dec, limits)?;
            Ok(ProposalOutputBody::CreatePrimitive(CreatePrimitiveOutput {
                primitive_id,
            }))
        }
        "close_primitive" => {
            let map_len = decode_map_len(dec, limits)?;
            for _ in 0..map_len {
                decode_text(dec, limits)?;
                skip_value(dec)?;
            }
            Ok(ProposalOutputBody::ClosePrimitive(ClosePrimitiveOutput {}))
        }
        "proposal" => {
            let map_len = decode_map_len(dec, limits)?;
            let mut payload = None;
            for _ in 0..map_len {
                match decode_text(dec, limits)? {
                    "payload" => {
                        payload =
                            Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "payload")?));
                    }
                    _ => skip_value(dec)?,
                }
            }
            Ok(ProposalOutputBody::Proposal(PrimitiveProposalOutput {
                payload: payload.ok_or(SnapshotDecodeError::MissingField("payload"))?,
            }))
        }
        "failure" => {
            let map_len = decode_map_len(dec, limits)?;
            let mut status = None;
            let mut message = None;
            for _ in 0..map_len {
                match decode_text(dec, limits)? {
                    "status" => {
                        let raw = decode_u32(dec, "status")?;
                        status = Some(FailureStatus::from_wire(raw).ok_or(
                            SnapshotDecodeError::InvalidField {
                                field: "status",
                                reason: format!("unknown status {raw}"),
                            },
                        )?);
                    }
                    "message" => message = Some(decode_text(dec, limits)?.to_string()),
                    _ => skip_value(dec)?,
                }
            }
            Ok(ProposalOutputBody::Failure(Failure {
                status: status.ok_or(SnapshotDecodeError::MissingField("status"))?,
                message: message.ok_or(SnapshotDecodeError::MissingField("message"))?,
            }))
        }
        other => Err(SnapshotDecodeError::InvalidField {
            field: "kind",
            reason: format!("unknown output kind {other}"),
        }),
    }
}

fn decode_primitive_id_body(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<PrimitiveId, SnapshotDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut primitive_id = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "primitive_id" => primitive_id = Some(PrimitiveId::new(dec.u64()?)),
            _ => skip_value(dec)?,
        }
    }
    primitive_id.ok_or(SnapshotDecodeError::MissingField("primitive_id"))
}
