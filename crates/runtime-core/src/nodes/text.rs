//! Text accumulation node

use super::PipelineNode;
use crate::data::RuntimeData;
use crate::{Error, Result};
use async_trait::async_trait;

/// Accumulates text inputs and emits the joined result when the stream
/// flushes. `params.separator` (default " ") joins the pieces.
pub struct TextCollectorNode {
    node_id: String,
    separator: String,
    pieces: Vec<String>,
    stream_id: String,
}

impl TextCollectorNode {
    /// Create from manifest params
    pub fn new(node_id: &str, params: &serde_json::Value) -> Self {
        let separator = params
            .get("separator")
            .and_then(|v| v.as_str())
            .unwrap_or(" ")
            .to_string();
        Self {
            node_id: node_id.to_string(),
            separator,
            pieces: Vec::new(),
            stream_id: String::new(),
        }
    }
}

#[async_trait]
impl PipelineNode for TextCollectorNode {
    fn node_type(&self) -> &'static str {
        "TextCollector"
    }

    async fn process(&mut self, input: RuntimeData) -> Result<Vec<RuntimeData>> {
        match input {
            RuntimeData::Text { content, stream_id } => {
                self.stream_id = stream_id;
                self.pieces.push(content);
                Ok(Vec::new())
            }
            other => Err(Error::node_process(
                &self.node_id,
                format!("expected text input, got {}", other.data_type()),
            )),
        }
    }

    async fn flush(&mut self) -> Result<Vec<RuntimeData>> {
        if self.pieces.is_empty() {
            return Ok(Vec::new());
        }
        let joined = self.pieces.join(&self.separator);
        self.pieces.clear();
        Ok(vec![RuntimeData::Text {
            content: joined,
            stream_id: std::mem::take(&mut self.stream_id),
        }])
    }
}
