//! Transport-agnostic data container

use crate::data::RuntimeData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One `RuntimeData` plus the envelope exchanged between the core and its
/// transports: owning session, stream ordering, and free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportData {
    /// Core payload
    pub data: RuntimeData,

    /// Session this packet belongs to; empty outside a streaming session
    #[serde(default)]
    pub session_id: String,

    /// Sequence number for stream ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,

    /// Transport-specific key-value pairs (request ids, trace headers, …)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl TransportData {
    /// Wrap a payload with an empty envelope
    pub fn new(data: RuntimeData) -> Self {
        Self {
            data,
            session_id: String::new(),
            sequence_number: None,
            metadata: HashMap::new(),
        }
    }

    /// Builder: set the owning session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Builder: set the sequence number
    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.sequence_number = Some(seq);
        self
    }

    /// Builder: add one metadata pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata lookup
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Copy this packet's envelope onto another payload
    pub fn envelope_onto(&self, data: RuntimeData) -> TransportData {
        TransportData {
            data,
            session_id: self.session_id.clone(),
            sequence_number: self.sequence_number,
            metadata: self.metadata.clone(),
        }
    }
}

impl From<RuntimeData> for TransportData {
    fn from(data: RuntimeData) -> Self {
        TransportData::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let data = TransportData::new(RuntimeData::text("hi", "t"))
            .with_session("sess-1")
            .with_sequence(42)
            .with_metadata("request_id", "abc");

        assert_eq!(data.session_id, "sess-1");
        assert_eq!(data.sequence_number, Some(42));
        assert_eq!(data.get_metadata("request_id"), Some("abc"));
        assert_eq!(data.get_metadata("missing"), None);
    }

    #[test]
    fn test_envelope_onto_preserves_metadata() {
        let input = TransportData::new(RuntimeData::text("in", "t"))
            .with_session("s")
            .with_sequence(7)
            .with_metadata("k", "v");
        let output = input.envelope_onto(RuntimeData::text("out", "t"));
        assert_eq!(output.session_id, "s");
        assert_eq!(output.sequence_number, Some(7));
        assert_eq!(output.get_metadata("k"), Some("v"));
        assert_eq!(output.data, RuntimeData::text("out", "t"));
    }
}
