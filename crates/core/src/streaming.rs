//! Channel-based sink for live REPL output
//!
//! Device output that does not belong to a synchronous exchange (echo of
//! interactive commands, program output, banners) is forwarded here for the
//! terminal display. Delivery happens on the transport's read path, which must
//! never block, so the sink uses `try_send` on a bounded channel and counts
//! what it had to drop when the display falls behind.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Bounded, non-blocking output channel
pub struct OutputSink {
    tx: mpsc::Sender<Bytes>,
    dropped: AtomicU64,
}

impl OutputSink {
    /// Create a sink with room for `capacity` chunks
    ///
    /// # Returns
    /// * `(OutputSink, mpsc::Receiver<Bytes>)` - sink and display side
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Forward a chunk without waiting
    ///
    /// Returns false when the chunk was dropped (display full or gone).
    pub fn deliver(&self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(data)) => {
                let total = self.dropped.fetch_add(data.len() as u64, Ordering::Relaxed) + data.len() as u64;
                tracing::warn!("Output sink full, dropped {} bytes ({} total)", data.len(), total);
                false
            }
            Err(TrySendError::Closed(data)) => {
                tracing::trace!("Output sink closed, discarding {} bytes", data.len());
                false
            }
        }
    }

    /// Bytes dropped because the display was not keeping up
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Check if the display side is gone
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_and_receive() {
        let (sink, mut rx) = OutputSink::new(4);
        assert!(sink.deliver(Bytes::from_static(b">>> ")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b">>> "));
    }

    #[tokio::test]
    async fn test_full_sink_drops_without_blocking() {
        let (sink, _rx) = OutputSink::new(1);
        assert!(sink.deliver(Bytes::from_static(b"first")));
        assert!(!sink.deliver(Bytes::from_static(b"second")));
        assert_eq!(sink.dropped_bytes(), 6);
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped() {
        let (sink, mut rx) = OutputSink::new(1);
        assert!(sink.deliver(Bytes::new()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_detection() {
        let (sink, rx) = OutputSink::new(1);
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.deliver(Bytes::from_static(b"late")));
        assert_eq!(sink.dropped_bytes(), 0);
    }
}
