//! Control message data structure
//!
//! Standardized directives for pipeline flow control: speculation
//! cancellation, batching hints, and deadline warnings. Control messages
//! travel on a side channel that bypasses data-edge ordering and may
//! overtake data items.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How a control message should be treated after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDisposition {
    /// Deliver normally
    Process,
    /// Deliver, but something is off (stale, session mismatch); the reason
    /// is logged by the caller
    ProcessWithWarning(String),
    /// Drop; the payload is structurally invalid
    Reject(String),
}

/// Out-of-band control directive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Directive payload
    pub kind: ControlKind,

    /// Session this message applies to
    pub session_id: String,

    /// Creation time, microseconds since Unix epoch
    pub timestamp_us: u64,

    /// Extensible metadata (JSON-compatible)
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Control directive payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlKind {
    /// Abandon speculative work covering the inclusive range
    /// `[from_timestamp_us, to_timestamp_us]` and discard already-computed
    /// buffers in that range. Receivers must be idempotent under repeated
    /// cancels.
    CancelSpeculation {
        /// Range start (inclusive), microseconds
        from_timestamp_us: u64,
        /// Range end (inclusive), microseconds
        to_timestamp_us: u64,
    },

    /// Advisory: batch-capable nodes may resize accordingly
    BatchHint {
        /// Suggested items per batch
        suggested_batch_size: u32,
    },

    /// Downstream should adapt quality/precision to meet the deadline
    DeadlineWarning {
        /// Deadline, microseconds from now
        deadline_us: u64,
    },

    /// Unrecognized directive from a newer peer; ignored by nodes
    #[serde(other)]
    Unknown,
}

/// Control older than this is delivered with a staleness warning
const STALE_THRESHOLD_US: u64 = 1_000_000;

impl ControlMessage {
    /// Create a cancel-speculation message
    pub fn cancel_speculation(
        session_id: impl Into<String>,
        from_timestamp_us: u64,
        to_timestamp_us: u64,
    ) -> Self {
        Self {
            kind: ControlKind::CancelSpeculation {
                from_timestamp_us,
                to_timestamp_us,
            },
            session_id: session_id.into(),
            timestamp_us: now_us(),
            metadata: JsonValue::Null,
        }
    }

    /// Create a batch hint message
    pub fn batch_hint(session_id: impl Into<String>, suggested_batch_size: u32) -> Self {
        Self {
            kind: ControlKind::BatchHint {
                suggested_batch_size,
            },
            session_id: session_id.into(),
            timestamp_us: now_us(),
            metadata: JsonValue::Null,
        }
    }

    /// Create a deadline warning message
    pub fn deadline_warning(session_id: impl Into<String>, deadline_us: u64) -> Self {
        Self {
            kind: ControlKind::DeadlineWarning { deadline_us },
            session_id: session_id.into(),
            timestamp_us: now_us(),
            metadata: JsonValue::Null,
        }
    }

    /// Structural range check: invalid payloads are rejected outright
    pub fn check_range(&self) -> std::result::Result<(), String> {
        match &self.kind {
            ControlKind::CancelSpeculation {
                from_timestamp_us,
                to_timestamp_us,
            } => {
                if from_timestamp_us >= to_timestamp_us {
                    return Err(format!(
                        "CancelSpeculation: from_timestamp_us ({from_timestamp_us}) >= to_timestamp_us ({to_timestamp_us})"
                    ));
                }
                Ok(())
            }
            ControlKind::BatchHint {
                suggested_batch_size,
            } => {
                if *suggested_batch_size == 0 {
                    return Err("BatchHint: suggested_batch_size must be > 0".to_string());
                }
                Ok(())
            }
            ControlKind::DeadlineWarning { deadline_us } => {
                if *deadline_us == 0 {
                    return Err("DeadlineWarning: deadline_us must be > 0".to_string());
                }
                Ok(())
            }
            ControlKind::Unknown => Ok(()),
        }
    }

    /// Classify the message against the receiving session.
    ///
    /// Malformed ranges are rejected. Staleness (>1 s) and session-id
    /// mismatch are delivered with a warning, never silently dropped.
    pub fn disposition(&self, current_session: &str) -> ControlDisposition {
        if let Err(reason) = self.check_range() {
            return ControlDisposition::Reject(reason);
        }

        let age_us = now_us().saturating_sub(self.timestamp_us);
        if age_us > STALE_THRESHOLD_US {
            return ControlDisposition::ProcessWithWarning(format!(
                "control message is {} ms old",
                age_us / 1000
            ));
        }

        if !current_session.is_empty() && self.session_id != current_session {
            return ControlDisposition::ProcessWithWarning(format!(
                "control message for session '{}' received in session '{}'",
                self.session_id, current_session
            ));
        }

        ControlDisposition::Process
    }

    /// Whether this cancels speculative work
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, ControlKind::CancelSpeculation { .. })
    }

    /// Whether the timestamp lies in this message's inclusive
    /// cancellation range
    pub fn cancels_timestamp(&self, ts_us: u64) -> bool {
        match self.kind {
            ControlKind::CancelSpeculation {
                from_timestamp_us,
                to_timestamp_us,
            } => ts_us >= from_timestamp_us && ts_us <= to_timestamp_us,
            _ => false,
        }
    }

    /// Rough in-memory footprint (for size accounting)
    pub fn approximate_size(&self) -> usize {
        let meta = serde_json::to_string(&self.metadata)
            .map(|s| s.len())
            .unwrap_or(0);
        self.session_id.len() + std::mem::size_of::<ControlKind>() + 8 + meta
    }
}

/// Current time in microseconds since Unix epoch
pub(crate) fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
