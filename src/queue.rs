/// Handoff queue between the stream ingestor and the queue consumer
///
/// Single producer, single consumer, strict FIFO. Unbounded by default; an
/// optional capacity turns `put` into a bounded wait. Both `put` and `get`
/// give control back after `timeout` so callers can re-check the shutdown flag.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Create a connected sender/receiver pair.
/// `capacity = None` keeps the queue unbounded.
pub fn handoff_queue<T>(capacity: Option<usize>) -> (HandoffSender<T>, HandoffReceiver<T>) {
    match capacity {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                HandoffSender { inner: SenderKind::Unbounded(tx) },
                HandoffReceiver { inner: ReceiverKind::Unbounded(rx) },
            )
        }
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.max(1));
            (
                HandoffSender { inner: SenderKind::Bounded(tx) },
                HandoffReceiver { inner: ReceiverKind::Bounded(rx) },
            )
        }
    }
}

/// Why a `put` did not enqueue. The item is always handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PutError<T> {
    /// No room within the timeout (bounded queues only)
    Timeout(T),
    /// Receiver is gone
    Closed(T),
}

impl<T> PutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PutError::Timeout(item) | PutError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutError::Timeout(_) => write!(f, "timed out waiting for queue capacity"),
            PutError::Closed(_) => write!(f, "handoff queue receiver dropped"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PutError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetError {
    /// Nothing arrived within the timeout
    Timeout,
    /// Sender is gone and the queue is drained
    Closed,
}

impl fmt::Display for GetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetError::Timeout => write!(f, "timed out waiting for an item"),
            GetError::Closed => write!(f, "handoff queue sender dropped"),
        }
    }
}

impl std::error::Error for GetError {}

enum SenderKind<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum ReceiverKind<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

pub struct HandoffSender<T> {
    inner: SenderKind<T>,
}

impl<T> HandoffSender<T> {
    /// Enqueue `item`, taking ownership of it. On an unbounded queue this never
    /// waits; on a bounded one it waits up to `timeout` for a free slot.
    pub async fn put(&self, item: T, timeout: Duration) -> Result<(), PutError<T>> {
        match &self.inner {
            SenderKind::Unbounded(tx) => tx.send(item).map_err(|e| PutError::Closed(e.0)),
            SenderKind::Bounded(tx) => {
                // Reserve first so a timeout never swallows the item
                match tokio::time::timeout(timeout, tx.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(item);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(PutError::Closed(item)),
                    Err(_) => Err(PutError::Timeout(item)),
                }
            }
        }
    }
}

pub struct HandoffReceiver<T> {
    inner: ReceiverKind<T>,
}

impl<T> HandoffReceiver<T> {
    /// Wait up to `timeout` for the next item in FIFO order
    pub async fn get(&mut self, timeout: Duration) -> Result<T, GetError> {
        let next = match &mut self.inner {
            ReceiverKind::Unbounded(rx) => tokio::time::timeout(timeout, rx.recv()).await,
            ReceiverKind::Bounded(rx) => tokio::time::timeout(timeout, rx.recv()).await,
        };
        match next {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(GetError::Closed),
            Err(_) => Err(GetError::Timeout),
        }
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        match &self.inner {
            ReceiverKind::Unbounded(rx) => rx.len(),
            ReceiverKind::Bounded(rx) => rx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_unbounded_preserves_fifo_order() {
        let (tx, mut rx) = handoff_queue::<String>(None);
        for addr in ["0xAAA", "0xBBB", "0xCCC", "0xAAA"] {
            tx.put(addr.to_string(), SHORT).await.unwrap();
        }
        assert_eq!(rx.len(), 4);

        let mut out = Vec::new();
        while let Ok(item) = rx.get(SHORT).await {
            out.push(item);
        }
        assert_eq!(out, vec!["0xAAA", "0xBBB", "0xCCC", "0xAAA"]);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_get_times_out_when_empty() {
        let (_tx, mut rx) = handoff_queue::<String>(None);
        let started = std::time::Instant::now();
        assert_eq!(rx.get(SHORT).await, Err(GetError::Timeout));
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_get_reports_closed_after_drain() {
        let (tx, mut rx) = handoff_queue::<u32>(None);
        tx.put(7, SHORT).await.unwrap();
        drop(tx);
        assert_eq!(rx.get(SHORT).await, Ok(7));
        assert_eq!(rx.get(SHORT).await, Err(GetError::Closed));
    }

    #[tokio::test]
    async fn test_bounded_put_times_out_and_returns_item() {
        let (tx, mut rx) = handoff_queue::<String>(Some(1));
        tx.put("first".to_string(), SHORT).await.unwrap();

        let err = tx.put("second".to_string(), SHORT).await.unwrap_err();
        assert_eq!(err, PutError::Timeout("second".to_string()));

        // Retrying with the returned item succeeds once there is room
        assert_eq!(rx.get(SHORT).await.unwrap(), "first");
        tx.put(err.into_inner(), SHORT).await.unwrap();
        assert_eq!(rx.get(SHORT).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_put_after_receiver_dropped_is_closed() {
        let (tx, rx) = handoff_queue::<String>(None);
        drop(rx);
        let err = tx.put("0xAAA".to_string(), SHORT).await.unwrap_err();
        assert!(matches!(err, PutError::Closed(ref s) if s == "0xAAA"));

        let (tx, rx) = handoff_queue::<String>(Some(4));
        drop(rx);
        assert!(matches!(tx.put("x".to_string(), SHORT).await, Err(PutError::Closed(_))));
    }

    #[tokio::test]
    async fn test_cross_thread_handoff() {
        let (tx, mut rx) = handoff_queue::<u32>(None);
        let producer = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                for i in 0..100 {
                    tx.put(i, SHORT).await.unwrap();
                }
            });
        });

        let mut seen = Vec::new();
        while seen.len() < 100 {
            if let Ok(i) = rx.get(Duration::from_secs(1)).await {
                seen.push(i);
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
