//! Callback Registry (C5): assigns stable `"hook_<N>"` ids to hook callbacks
//! at initialize time, looked up by id on inbound dispatch (spec §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::types::HookCallback;

pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<String, HookCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Assigns the next monotonic `hook_<N>` id to `callback` and returns it.
    pub async fn register(&self, callback: HookCallback) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("hook_{n}");
        self.callbacks.write().await.insert(id.clone(), callback);
        id
    }

    pub async fn get(&self, id: &str) -> Option<HookCallback> {
        self.callbacks.read().await.get(id).cloned()
    }

    /// Clears every registered callback, e.g. on initialize failure or
    /// handler close (spec §4.5, §4.9).
    pub async fn clear(&self) {
        self.callbacks.write().await.clear();
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoxFuture;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn noop_callback() -> HookCallback {
        Arc::new(|input: Value, _ctx| -> BoxFuture<'static, Value> { Box::pin(async move { input }) })
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_stable() {
        let registry = CallbackRegistry::new();
        let first = registry.register(noop_callback()).await;
        let second = registry.register(noop_callback()).await;
        assert_eq!(first, "hook_0");
        assert_eq!(second, "hook_1");
        assert!(registry.get(&first).await.is_some());
    }

    #[tokio::test]
    async fn clear_drops_all_registrations() {
        let registry = CallbackRegistry::new();
        let id = registry.register(noop_callback()).await;
        registry.clear().await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_id_returns_none() {
        let registry = CallbackRegistry::new();
        assert!(registry.get("hook_99").await.is_none());
        let _ = json!(null);
    }
}
