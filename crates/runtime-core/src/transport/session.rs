//! Streaming session handle
//!
//! [`StreamSession`] is the caller-facing surface of a streaming pipeline:
//! transports hold one per live stream and pump inputs/outputs through it.
//! [`StreamSessionHandle`] is the concrete implementation the runner hands
//! out.
//!
//! Methods take `&self` so the two directions can be pumped from separate
//! tasks; implementations guard their receive side internally.

use crate::transport::TransportData;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};

/// Stateful streaming interaction with a pipeline.
///
/// Lifecycle: created by `PipelineRunner::create_stream_session` or
/// `PipelineTransport::stream`; `send_input`/`recv_output` while active;
/// terminal after `close`. `recv_output` returning `Ok(None)` means
/// end-of-stream; after a session error it returns that error once and the
/// session is closed.
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Unique session identifier (UUID)
    fn session_id(&self) -> &str;

    /// Submit one input into the pipeline's source nodes
    async fn send_input(&self, data: TransportData) -> Result<()>;

    /// Await the next pipeline output; `Ok(None)` = session ended
    async fn recv_output(&self) -> Result<Option<TransportData>>;

    /// Close the session: no more inputs, in-flight work is cancelled,
    /// every node is cleaned up exactly once
    async fn close(&self) -> Result<()>;

    /// Whether the session still accepts inputs
    fn is_active(&self) -> bool;
}

/// Concrete session handle returned by the runner
pub struct StreamSessionHandle {
    session_id: String,
    input_tx: parking_lot::Mutex<Option<mpsc::Sender<TransportData>>>,
    cancel_tx: watch::Sender<bool>,
    active: AtomicBool,
    output_rx: Mutex<mpsc::Receiver<Result<TransportData>>>,
}

impl StreamSessionHandle {
    pub(crate) fn new(
        session_id: String,
        input_tx: mpsc::Sender<TransportData>,
        output_rx: mpsc::Receiver<Result<TransportData>>,
        cancel_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            session_id,
            input_tx: parking_lot::Mutex::new(Some(input_tx)),
            cancel_tx,
            active: AtomicBool::new(true),
            output_rx: Mutex::new(output_rx),
        }
    }

    /// Signal end-of-input without cancelling.
    ///
    /// Source nodes observe end-of-stream, streaming nodes flush their
    /// tails, remaining outputs drain through `recv_output`, and the
    /// session ends with `None`. `close` by contrast cancels in-flight
    /// work promptly.
    pub fn finish_input(&self) {
        self.input_tx.lock().take();
    }
}

#[async_trait]
impl StreamSession for StreamSessionHandle {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_input(&self, data: TransportData) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Execution(format!(
                "session {} is closed",
                self.session_id
            )));
        }
        let tx = self.input_tx.lock().clone().ok_or_else(|| {
            Error::Execution(format!("session {} input already finished", self.session_id))
        })?;
        tx.send(data).await.map_err(|_| {
            self.active.store(false, Ordering::Release);
            Error::Execution(format!("session {} input channel closed", self.session_id))
        })
    }

    async fn recv_output(&self) -> Result<Option<TransportData>> {
        let mut output_rx = self.output_rx.lock().await;
        match output_rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(err)) => {
                // First error closes the session; later recv calls see
                // end-of-stream
                self.active.store(false, Ordering::Release);
                Err(err)
            }
            None => {
                self.active.store(false, Ordering::Release);
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            // Idempotent
            return Ok(());
        }
        let _ = self.cancel_tx.send(true);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
