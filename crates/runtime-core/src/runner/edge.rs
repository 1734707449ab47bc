//! Bounded pipeline edges
//!
//! Each connection becomes one channel with at most one writer task and one
//! reader task. Regular edges are bounded mpsc channels: a full edge blocks
//! its producer and backpressure cascades upstream. Edges into a node
//! configured lossy use a broadcast ring instead, which drops the oldest
//! items on overflow; drops are counted in session metrics.

use crate::data::RuntimeData;
use crate::metrics::SessionMetrics;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

/// Sending half of an edge
pub enum EdgeSender {
    /// Blocking-on-full edge (the default)
    Bounded(mpsc::Sender<RuntimeData>),
    /// Drop-oldest edge into a lossy node
    Lossy(broadcast::Sender<RuntimeData>),
}

/// Receiving half of an edge
pub enum EdgeReceiver {
    /// Blocking-on-full edge (the default)
    Bounded(mpsc::Receiver<RuntimeData>),
    /// Drop-oldest edge into a lossy node
    Lossy(broadcast::Receiver<RuntimeData>, Arc<SessionMetrics>),
}

/// Create one edge.
///
/// `lossy` follows the consuming node's configuration.
pub fn edge(
    capacity: usize,
    lossy: bool,
    metrics: Arc<SessionMetrics>,
) -> (EdgeSender, EdgeReceiver) {
    if lossy {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (EdgeSender::Lossy(tx), EdgeReceiver::Lossy(rx, metrics))
    } else {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EdgeSender::Bounded(tx), EdgeReceiver::Bounded(rx))
    }
}

impl EdgeSender {
    /// Deliver one item.
    ///
    /// Bounded edges await space (the backpressure path); lossy edges
    /// never block. `Err(())` means the consumer is gone.
    pub async fn send(&self, item: RuntimeData) -> Result<(), ()> {
        match self {
            EdgeSender::Bounded(tx) => tx.send(item).await.map_err(|_| ()),
            EdgeSender::Lossy(tx) => tx.send(item).map(|_| ()).map_err(|_| ()),
        }
    }
}

impl EdgeReceiver {
    /// Convert into a stream of items for fan-in merging.
    ///
    /// Lossy lag (overwritten items) is recorded as dropped and skipped.
    pub fn into_stream(
        self,
    ) -> std::pin::Pin<Box<dyn futures::Stream<Item = RuntimeData> + Send>> {
        match self {
            EdgeReceiver::Bounded(rx) => ReceiverStream::new(rx).boxed(),
            EdgeReceiver::Lossy(rx, metrics) => BroadcastStream::new(rx)
                .filter_map(move |item| {
                    let metrics = Arc::clone(&metrics);
                    async move {
                        match item {
                            Ok(item) => Some(item),
                            Err(BroadcastStreamRecvError::Lagged(n)) => {
                                for _ in 0..n {
                                    metrics.record_lossy_drop();
                                }
                                None
                            }
                        }
                    }
                })
                .boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_edge_fifo() {
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, rx) = edge(4, false, metrics);
        for i in 0..4u64 {
            tx.send(RuntimeData::text(i.to_string(), "t")).await.unwrap();
        }
        drop(tx);
        let items: Vec<_> = rx.into_stream().collect().await;
        let texts: Vec<String> = items
            .iter()
            .map(|d| match d {
                RuntimeData::Text { content, .. } => content.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_bounded_edge_blocks_when_full() {
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, _rx) = edge(1, false, metrics);
        tx.send(RuntimeData::text("a", "t")).await.unwrap();
        // Second send must not complete while the edge is full
        let pending = tx.send(RuntimeData::text("b", "t"));
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), pending).await;
        assert!(result.is_err(), "send should still be blocked");
    }

    #[tokio::test]
    async fn test_lossy_edge_drops_oldest() {
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, rx) = edge(2, true, Arc::clone(&metrics));
        for i in 0..5u64 {
            tx.send(RuntimeData::text(i.to_string(), "t")).await.unwrap();
        }
        drop(tx);
        let items: Vec<_> = rx.into_stream().collect().await;
        // Capacity 2: only the newest two survive
        let texts: Vec<String> = items
            .iter()
            .map(|d| match d {
                RuntimeData::Text { content, .. } => content.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["3", "4"]);
        assert_eq!(metrics.snapshot().lossy_drops, 3);
    }
}
