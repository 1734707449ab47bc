//! Pass-through and echo nodes
//!
//! Used for wiring tests and as sinks/sources in pipelines that only need
//! routing semantics.

use super::{PipelineNode, SessionContext};
use crate::data::{ControlMessage, RuntimeData};
use crate::Result;
use async_trait::async_trait;

/// Returns every input unchanged
pub struct PassthroughNode {
    node_id: String,
}

impl PassthroughNode {
    /// Create from manifest params (none are read)
    pub fn new(node_id: &str, _params: &serde_json::Value) -> Self {
        Self {
            node_id: node_id.to_string(),
        }
    }
}

#[async_trait]
impl PipelineNode for PassthroughNode {
    fn node_type(&self) -> &'static str {
        "Passthrough"
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        tracing::debug!(node_id = %self.node_id, session = %ctx.session_id, "passthrough ready");
        Ok(())
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        Ok(vec![input])
    }
}

/// Returns the input unchanged, discarding buffers covered by speculation
/// cancels. The discard behavior makes it usable as the downstream node in
/// cancellation tests.
pub struct EchoNode {
    node_id: String,
    cancelled_ranges: Vec<(u64, u64)>,
    metrics: Option<std::sync::Arc<crate::metrics::SessionMetrics>>,
}

impl EchoNode {
    /// Create from manifest params (none are read)
    pub fn new(node_id: &str, _params: &serde_json::Value) -> Self {
        Self {
            node_id: node_id.to_string(),
            cancelled_ranges: Vec::new(),
            metrics: None,
        }
    }

    fn is_cancelled(&self, ts_us: u64) -> bool {
        // Cancellation ranges are inclusive on both ends
        self.cancelled_ranges
            .iter()
            .any(|&(from, to)| ts_us >= from && ts_us <= to)
    }
}

#[async_trait]
impl PipelineNode for EchoNode {
    fn node_type(&self) -> &'static str {
        "Echo"
    }

    async fn initialize(&mut self, ctx: &SessionContext) -> Result<()> {
        self.metrics = Some(std::sync::Arc::clone(&ctx.metrics));
        Ok(())
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        if let Some(ts) = input.timestamp_us() {
            if self.is_cancelled(ts) {
                tracing::debug!(node_id = %self.node_id, ts, "discarding cancelled buffer");
                if let Some(metrics) = &self.metrics {
                    metrics.record_cancelled_buffer();
                }
                return Ok(Vec::new());
            }
        }
        Ok(vec![input])
    }

    async fn on_control(&mut self, msg: &ControlMessage) -> Result<()> {
        if let crate::data::ControlKind::CancelSpeculation {
            from_timestamp_us,
            to_timestamp_us,
        } = msg.kind
        {
            let range = (from_timestamp_us, to_timestamp_us);
            // Idempotent under repeated cancels
            if !self.cancelled_ranges.contains(&range) {
                self.cancelled_ranges.push(range);
            }
        }
        Ok(())
    }
}
