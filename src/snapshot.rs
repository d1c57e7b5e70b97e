//! Snapshot codec: varints and length-prefixed CBOR messages.
//!
//! Every message is written as an unsigned LEB128 length followed by the
//! message's canonical CBOR bytes. Reader failures are fatal: a replica
//! that cannot decode its snapshot cannot safely continue.

use std::convert::Infallible;
use std::io::{Read, Write};

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::limits::Limits;

const VARINT_MAX_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum SnapshotEncodeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("message length {got} exceeds limit {max}")]
    MessageTooLarge { got: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum SnapshotDecodeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("message length {got} exceeds limit {max}")]
    MessageTooLarge { got: u64, max: usize },
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

/// A snapshotable record with a hand-rolled CBOR schema.
pub trait Message: Sized {
    fn encode(&self, enc: &mut Encoder<&mut Vec<u8>>) -> Result<(), SnapshotEncodeError>;
    fn decode(dec: &mut Decoder<'_>, limits: &Limits) -> Result<Self, SnapshotDecodeError>;
}

/// Length-prefixing writer over a caller-supplied sink.
pub struct SnapshotWriter<'a> {
    out: &'a mut dyn Write,
    limits: Limits,
}

impl<'a> SnapshotWriter<'a> {
    pub fn new(out: &'a mut dyn Write, limits: &Limits) -> Self {
        Self {
            out,
            limits: limits.clone(),
        }
    }

    pub fn write_varint(&mut self, mut value: u64) -> Result<(), SnapshotEncodeError> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.out.write_all(&[byte])?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    pub fn write_message<M: Message>(&mut self, message: &M) -> Result<(), SnapshotEncodeError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        message.encode(&mut enc)?;
        if buf.len() > self.limits.max_snapshot_message_bytes {
            return Err(SnapshotEncodeError::MessageTooLarge {
                got: buf.len(),
                max: self.limits.max_snapshot_message_bytes,
            });
        }
        self.write_varint(buf.len() as u64)?;
        self.out.write_all(&buf)?;
        Ok(())
    }
}

/// Exact dual of [`SnapshotWriter`].
pub struct SnapshotReader<'a> {
    input: &'a mut dyn Read,
    limits: Limits,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(input: &'a mut dyn Read, limits: &Limits) -> Self {
        Self {
            input,
            limits: limits.clone(),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn read_varint(&mut self) -> Result<u64, SnapshotDecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for _ in 0..VARINT_MAX_BYTES {
            let mut byte = [0u8; 1];
            self.input.read_exact(&mut byte)?;
            let chunk = (byte[0] & 0x7f) as u64;
            value |= chunk
                .checked_shl(shift)
                .filter(|_| shift < 64 && (shift != 63 || chunk <= 1))
                .ok_or(SnapshotDecodeError::VarintOverflow)?;
            if byte[0] & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(SnapshotDecodeError::VarintOverflow)
    }

    pub fn read_message<M: Message>(&mut self) -> Result<M, SnapshotDecodeError> {
        let len = self.read_varint()?;
        if len > self.limits.max_snapshot_message_bytes as u64 {
            return Err(SnapshotDecodeError::MessageTooLarge {
                got: len,
                max: self.limits.max_snapshot_message_bytes,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.input.read_exact(&mut buf)?;

        let mut dec = Decoder::new(&buf);
        let message = M::decode(&mut dec, &self.limits)?;
        if dec.datatype().is_ok() {
            return Err(SnapshotDecodeError::TrailingBytes);
        }
        Ok(message)
    }
}

pub(crate) fn decode_map_len(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<usize, SnapshotDecodeError> {
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(SnapshotDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(SnapshotDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| SnapshotDecodeError::DecodeLimit("max_cbor_map_entries"))
}

pub(crate) fn decode_array_len(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<usize, SnapshotDecodeError> {
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(SnapshotDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_array_entries as u64 {
        return Err(SnapshotDecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| SnapshotDecodeError::DecodeLimit("max_cbor_array_entries"))
}

pub(crate) fn decode_text<'b>(
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<&'b str, SnapshotDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(SnapshotDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_string_len {
        return Err(SnapshotDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(s)
}

pub(crate) fn decode_bytes<'b>(
    dec: &mut Decoder<'b>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'b [u8], SnapshotDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(SnapshotDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_string_len {
        return Err(SnapshotDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

pub(crate) fn decode_u32(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<u32, SnapshotDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| SnapshotDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

pub(crate) fn skip_value(dec: &mut Decoder<'_>) -> Result<(), SnapshotDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(SnapshotDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}
