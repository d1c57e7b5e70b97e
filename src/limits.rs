//! Decode and defensive limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Limits applied to everything the state machine decodes: snapshot
/// messages, CBOR structure, and client-supplied keep-alive filters.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Upper bound on a single length-prefixed snapshot message.
    pub max_snapshot_message_bytes: usize,
    /// Upper bound on any varint-prefixed count in a snapshot (sessions,
    /// proposals per session).
    pub max_snapshot_entries: usize,
    /// Upper bound on a serialized keep-alive input filter.
    pub max_filter_bytes: usize,

    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_text_string_len: usize,
    pub max_cbor_bytes_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_snapshot_message_bytes: 4 * 1024 * 1024,
            max_snapshot_entries: 1 << 20,
            max_filter_bytes: 1024 * 1024,
            max_cbor_map_entries: 64,
            max_cbor_array_entries: 1 << 16,
            max_cbor_text_string_len: 4096,
            max_cbor_bytes_string_len: 4 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_nonzero() {
        let limits = Limits::default();
        assert!(limits.max_snapshot_message_bytes > 0);
        assert!(limits.max_snapshot_entries > 0);
        assert!(limits.max_filter_bytes > 0);
        assert!(limits.max_cbor_map_entries > 0);
        assert!(limits.max_cbor_array_entries > 0);
    }

    #[test]
    fn serde_roundtrip_with_partial_input() {
        let parsed: Limits = serde_json::from_str(r#"{"max_filter_bytes": 16}"#).unwrap();
        assert_eq!(parsed.max_filter_bytes, 16);
        assert_eq!(
            parsed.max_snapshot_message_bytes,
            Limits::default().max_snapshot_message_bytes
        );
    }
}
