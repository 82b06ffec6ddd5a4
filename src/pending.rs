//! Pending-Request Table (C4): correlates outbound `control_request` ids
//! with the one-shot slot their eventual `control_response` completes
//! (spec §4.4).

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::SdkError;

type Slot = oneshot::Sender<Result<Value, SdkError>>;

pub struct PendingTable {
    slots: Mutex<HashMap<String, Slot>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new outstanding request and returns the receiver the
    /// caller should await for its eventual result.
    pub async fn register(&self, request_id: impl Into<String>) -> oneshot::Receiver<Result<Value, SdkError>> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(request_id.into(), tx);
        rx
    }

    /// Completes a pending slot with a successful payload. Returns `false`
    /// if no slot was registered under this id (late or duplicate response).
    pub async fn complete_success(&self, request_id: &str, payload: Value) -> bool {
        self.complete(request_id, Ok(payload)).await
    }

    pub async fn complete_error(&self, request_id: &str, message: String) -> bool {
        self.complete(request_id, Err(SdkError::other(message))).await
    }

    async fn complete(&self, request_id: &str, result: Result<Value, SdkError>) -> bool {
        if let Some(tx) = self.slots.lock().await.remove(request_id) {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    /// Drops a slot without completing it, e.g. after the caller's own
    /// timeout has already elapsed and no one is waiting on the receiver.
    pub async fn forget(&self, request_id: &str) {
        self.slots.lock().await.remove(request_id);
    }

    /// Aborts every outstanding request with the same failure, used when the
    /// reader loop dies (spec §4.4, §4.9).
    pub async fn abort_all(&self, message: impl Into<String>) {
        let message = message.into();
        let mut slots = self.slots.lock().await;
        for (_, tx) in slots.drain() {
            let _ = tx.send(Err(SdkError::other(message.clone())));
        }
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn success_completes_registered_slot() {
        let table = PendingTable::new();
        let rx = table.register("req_1").await;
        assert!(table.complete_success("req_1", json!({"ok": true})).await);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn unknown_id_completion_is_a_no_op() {
        let table = PendingTable::new();
        assert!(!table.complete_success("missing", json!(null)).await);
    }

    #[tokio::test]
    async fn abort_all_fails_every_outstanding_slot() {
        let table = PendingTable::new();
        let a = table.register("a").await;
        let b = table.register("b").await;
        table.abort_all("transport closed").await;
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
    }
}
