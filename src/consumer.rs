/// Queue consumer - drains the handoff queue into the aggregate store
///
/// One upsert completes before the next item is fetched. Runs on its own
/// thread because the store does blocking SQLite I/O.

use anyhow::{Context, Result};
use log::{debug, error, info};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::persistence::AddressStore;
use crate::queue::{GetError, HandoffReceiver};
use crate::settings::QUEUE_OP_TIMEOUT;
use crate::shutdown::ShutdownFlag;

pub struct QueueConsumer {
    queue: HandoffReceiver<String>,
    store: Arc<dyn AddressStore>,
    shutdown: ShutdownFlag,
    timeout: Duration,
    stored: u64,
}

impl QueueConsumer {
    pub fn new(
        queue: HandoffReceiver<String>,
        store: Arc<dyn AddressStore>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            queue,
            store,
            shutdown,
            timeout: QUEUE_OP_TIMEOUT,
            stored: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Addresses written to the store so far
    pub fn stored(&self) -> u64 {
        self.stored
    }

    /// Loop until shutdown; a queue or store failure trips the flag
    pub async fn run(&mut self) {
        while !self.shutdown.is_set() {
            if let Err(e) = self.step().await {
                if self.shutdown.is_set() {
                    debug!("[consumer] Ignoring error during shutdown: {:#}", e);
                } else {
                    error!("[consumer] Fatal error: {:#}", e);
                    self.shutdown.trigger();
                }
                break;
            }
        }
        let left = self.queue.len();
        if left > 0 {
            info!("[consumer] Stopped with {} unconsumed addresses in queue", left);
        }
        info!("[consumer] Stopped after storing {} addresses", self.stored);
    }

    /// Fetch at most one item and store it
    async fn step(&mut self) -> Result<()> {
        match self.queue.get(self.timeout).await {
            Ok(address) => {
                self.store.upsert(&address)?;
                self.stored += 1;
                Ok(())
            }
            Err(GetError::Timeout) => Ok(()),
            Err(e @ GetError::Closed) => Err(e).context("Handoff queue retrieval failed"),
        }
    }
}

/// Run the consumer on a dedicated thread with its own single-threaded runtime
pub fn spawn(
    queue: HandoffReceiver<String>,
    store: Arc<dyn AddressStore>,
    shutdown: ShutdownFlag,
) -> Result<JoinHandle<()>> {
    let mut consumer = QueueConsumer::new(queue, store, shutdown.clone());

    std::thread::Builder::new()
        .name("consumer".into())
        .spawn(move || {
            let _guard = shutdown.panic_guard();
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[consumer] Failed to create tokio runtime: {}", e);
                    shutdown.trigger();
                    return;
                }
            };
            rt.block_on(consumer.run());
        })
        .context("Failed to spawn consumer thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AddressRecord;
    use crate::queue::handoff_queue;
    use std::sync::Mutex;

    const SHORT: Duration = Duration::from_millis(20);

    /// In-memory store that records upserts in call order
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl AddressStore for RecordingStore {
        fn upsert(&self, address: &str) -> Result<()> {
            if self.fail_on == Some(address) {
                anyhow::bail!("disk I/O error");
            }
            self.calls.lock().unwrap().push(address.to_string());
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<AddressRecord>> {
            Ok(Vec::new())
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_upserts_in_fifo_order() {
        let (tx, rx) = handoff_queue::<String>(None);
        let store = Arc::new(RecordingStore::default());
        let shutdown = ShutdownFlag::new();

        for addr in ["0xAAA", "0xBBB", "0xAAA"] {
            tx.put(addr.to_string(), SHORT).await.unwrap();
        }

        let mut consumer = QueueConsumer::new(rx, store.clone(), shutdown.clone()).with_timeout(SHORT);
        let task = tokio::spawn(async move {
            consumer.run().await;
            consumer.stored()
        });

        wait_until(|| store.calls.lock().unwrap().len() == 3).await;
        shutdown.trigger();
        assert_eq!(task.await.unwrap(), 3);
        assert_eq!(*store.calls.lock().unwrap(), vec!["0xAAA", "0xBBB", "0xAAA"]);
    }

    #[tokio::test]
    async fn test_exits_on_shutdown_when_idle() {
        let (_tx, rx) = handoff_queue::<String>(None);
        let shutdown = ShutdownFlag::new();
        let mut consumer =
            QueueConsumer::new(rx, Arc::new(RecordingStore::default()), shutdown.clone()).with_timeout(SHORT);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), consumer.run())
            .await
            .expect("consumer should exit promptly");
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let (tx, rx) = handoff_queue::<String>(None);
        let store = Arc::new(RecordingStore {
            fail_on: Some("0xBAD"),
            ..Default::default()
        });
        let shutdown = ShutdownFlag::new();

        tx.put("0xBAD".to_string(), SHORT).await.unwrap();
        tx.put("0xAAA".to_string(), SHORT).await.unwrap();

        let mut consumer = QueueConsumer::new(rx, store.clone(), shutdown.clone()).with_timeout(SHORT);
        tokio::time::timeout(Duration::from_secs(1), consumer.run()).await.unwrap();

        assert!(shutdown.is_set());
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_is_fatal() {
        let (tx, rx) = handoff_queue::<String>(None);
        drop(tx);
        let shutdown = ShutdownFlag::new();
        let mut consumer =
            QueueConsumer::new(rx, Arc::new(RecordingStore::default()), shutdown.clone()).with_timeout(SHORT);

        tokio::time::timeout(Duration::from_secs(1), consumer.run()).await.unwrap();
        assert!(shutdown.is_set());
    }

    struct PanickingStore;

    impl AddressStore for PanickingStore {
        fn upsert(&self, _address: &str) -> Result<()> {
            panic!("store blew up");
        }

        fn snapshot(&self) -> Result<Vec<AddressRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_worker_panic_trips_shutdown() {
        let (tx, rx) = handoff_queue::<String>(None);
        let shutdown = ShutdownFlag::new();
        let handle = spawn(rx, Arc::new(PanickingStore), shutdown.clone()).unwrap();

        tx.put("0xAAA".to_string(), SHORT).await.unwrap();
        let joined = tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
        assert!(joined.is_err());
        assert!(shutdown.is_set());
        drop(tx);
    }
}
