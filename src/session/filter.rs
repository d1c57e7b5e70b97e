//! Keep-alive input filter.
//!
//! A client's keep-alive carries a Bloom filter of the input sequence
//! numbers it still considers outstanding, keyed by the big-endian 8-byte
//! encoding of the sequence number. The interchange format is the JSON
//! document produced by the driver's filter library: `{"m", "k", "bits"}`
//! with the bit array hex-encoded. Hashing is double hashing over the two
//! leading 64-bit words of `Sha256(key)`, so membership tests are
//! deterministic across replicas and releases.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::limits::Limits;

const MIN_BITS: u64 = 8;
const MAX_HASHES: u32 = 32;

#[derive(Debug, Error)]
pub enum FilterDecodeError {
    #[error("filter length {got} exceeds limit {max}")]
    TooLarge { got: usize, max: usize },
    #[error("malformed filter document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed filter bits: {0}")]
    Bits(#[from] hex::FromHexError),
    #[error("invalid filter geometry: {reason}")]
    Geometry { reason: String },
}

#[derive(Serialize, Deserialize)]
struct FilterRepr {
    m: u64,
    k: u32,
    bits: String,
}

/// Bloom filter over client input sequence numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFilter {
    bit_count: u64,
    hash_count: u32,
    bits: Vec<u8>,
}

impl InputFilter {
    /// Build a filter sized for `items` entries at the given false-positive
    /// rate, mirroring the driver library's constructor.
    pub fn with_estimates(items: u64, false_positive_rate: f64) -> Self {
        let items = items.max(1) as f64;
        let rate = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-items * rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let bit_count = bit_count.max(MIN_BITS);
        let hash_count = (((bit_count as f64 / items) * ln2).ceil() as u32).clamp(1, MAX_HASHES);
        Self {
            bit_count,
            hash_count,
            bits: vec![0u8; bit_count.div_ceil(8) as usize],
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.hash_count {
            let bit = index_at(h1, h2, i, self.bit_count);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.hash_count).all(|i| {
            let bit = index_at(h1, h2, i, self.bit_count);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Serialize to the JSON interchange document.
    pub fn encode(&self) -> Vec<u8> {
        let repr = FilterRepr {
            m: self.bit_count,
            k: self.hash_count,
            bits: hex::encode(&self.bits),
        };
        // A struct of two integers and a string cannot fail to serialize.
        serde_json::to_vec(&repr).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8], limits: &Limits) -> Result<Self, FilterDecodeError> {
        if bytes.len() > limits.max_filter_bytes {
            return Err(FilterDecodeError::TooLarge {
                got: bytes.len(),
                max: limits.max_filter_bytes,
            });
        }
        let repr: FilterRepr = serde_json::from_slice(bytes)?;
        let bits = hex::decode(&repr.bits)?;
        if repr.m == 0 || repr.k == 0 {
            return Err(FilterDecodeError::Geometry {
                reason: format!("m {} and k {} must be nonzero", repr.m, repr.k),
            });
        }
        if repr.k > MAX_HASHES {
            return Err(FilterDecodeError::Geometry {
                reason: format!("k {} exceeds maximum {MAX_HASHES}", repr.k),
            });
        }
        if (bits.len() as u64) * 8 < repr.m {
            return Err(FilterDecodeError::Geometry {
                reason: format!("bit array {} bytes is short of m {}", bits.len(), repr.m),
            });
        }
        Ok(Self {
            bit_count: repr.m,
            hash_count: repr.k,
            bits,
        })
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let digest = Sha256::digest(key);
    let mut h1 = [0u8; 8];
    let mut h2 = [0u8; 8];
    h1.copy_from_slice(&digest[0..8]);
    h2.copy_from_slice(&digest[8..16]);
    (u64::from_be_bytes(h1), u64::from_be_bytes(h2))
}

fn index_at(h1: u64, h2: u64, i: u32, bit_count: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % bit_count
}
