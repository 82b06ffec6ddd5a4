//! Consumer Queue (C8): a bounded, multi-consumer sink for classified data
//! records, with `{type:"end"}`/`{type:"error"}` sentinels collapsed into the
//! `QueueConsumer::recv` result (spec §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::error::{Result, SdkError};
use crate::types::Record;

/// Default bound on outstanding queued records (spec §6).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
enum QueueItem {
    Data(Record),
    End,
    Error(String),
}

/// Producer side of the queue. Cloning a `ConsumerQueue`'s consumers
/// distributes records across them (work-stealing over one shared channel)
/// rather than broadcasting, matching the "each record delivered to exactly
/// one iterator" rule when multiple consumers are in play.
pub struct ConsumerQueue {
    sender: mpsc::Sender<QueueItem>,
    receiver: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    closed: Arc<AtomicBool>,
}

impl ConsumerQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn push_data(&self, record: Record) {
        self.push(QueueItem::Data(record)).await;
    }

    pub async fn push_end(&self) {
        self.push(QueueItem::End).await;
    }

    pub async fn push_error(&self, message: impl Into<String>) {
        self.push(QueueItem::Error(message.into())).await;
    }

    async fn push(&self, item: QueueItem) {
        match tokio::time::timeout(ENQUEUE_TIMEOUT, self.sender.send(item)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // No consumer holds the receiver anymore; nothing to deliver to.
            }
            Err(_) => warn!(
                timeout = ?ENQUEUE_TIMEOUT,
                "consumer queue full, dropping record"
            ),
        }
    }

    /// Marks the queue closed so blocked consumers stop polling once the
    /// channel itself drains, even if no `end`/`error` sentinel arrives.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            receiver: self.receiver.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// One reader's view of the queue.
pub struct QueueConsumer {
    receiver: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    closed: Arc<AtomicBool>,
}

impl QueueConsumer {
    /// Waits for the next record. Returns `Ok(None)` at end-of-stream and
    /// `Err` if the stream ended with a stashed error. Polls the shared
    /// receiver in 400ms slices so a concurrent `mark_closed` is observed
    /// promptly even with no further traffic.
    pub async fn recv(&self) -> Result<Option<Record>> {
        loop {
            let mut receiver = self.receiver.lock().await;
            match tokio::time::timeout(CONSUMER_POLL_INTERVAL, receiver.recv()).await {
                Ok(Some(QueueItem::Data(record))) => return Ok(Some(record)),
                Ok(Some(QueueItem::End)) => return Ok(None),
                Ok(Some(QueueItem::Error(message))) => return Err(SdkError::other(message)),
                Ok(None) => return Ok(None),
                Err(_) => {
                    drop(receiver);
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_records_in_order() {
        let queue = ConsumerQueue::new(DEFAULT_QUEUE_CAPACITY);
        let consumer = queue.consumer();
        queue.push_data(serde_json::json!({"n": 1})).await;
        queue.push_data(serde_json::json!({"n": 2})).await;
        queue.push_end().await;

        assert_eq!(consumer.recv().await.unwrap().unwrap()["n"], 1);
        assert_eq!(consumer.recv().await.unwrap().unwrap()["n"], 2);
        assert!(consumer.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_sentinel_surfaces_as_err() {
        let queue = ConsumerQueue::new(DEFAULT_QUEUE_CAPACITY);
        let consumer = queue.consumer();
        queue.push_error("boom").await;
        let err = consumer.recv().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn consumer_created_after_error_and_mark_closed_does_not_hang() {
        let queue = ConsumerQueue::new(DEFAULT_QUEUE_CAPACITY);
        let first = queue.consumer();
        queue.push_error("boom").await;
        queue.push_end().await;
        queue.mark_closed();

        assert!(first.recv().await.is_err());

        let second = queue.consumer();
        assert!(second.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_consumers_split_the_stream() {
        let queue = ConsumerQueue::new(DEFAULT_QUEUE_CAPACITY);
        let a = queue.consumer();
        let b = queue.consumer();
        for i in 0..4 {
            queue.push_data(serde_json::json!({"n": i})).await;
        }
        queue.push_end().await;

        let mut seen = Vec::new();
        loop {
            tokio::select! {
                r = a.recv() => match r.unwrap() { Some(v) => seen.push(v["n"].as_i64().unwrap()), None => break },
                r = b.recv() => match r.unwrap() { Some(v) => seen.push(v["n"].as_i64().unwrap()), None => break },
            }
            if seen.len() == 4 {
                break;
            }
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
